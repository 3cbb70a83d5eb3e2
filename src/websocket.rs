//! # WebSocket Job Channel
//!
//! Carries transcription jobs over `/ws/transcribe`. Each connection is an
//! independent Actix actor.
//!
//! ## WebSocket Protocol:
//! 1. **Job request**: client sends a JSON text frame describing the job
//!    (model, multilingual, quantized, subtask, optional language/device)
//! 2. **Audio**: client sends one binary frame (WAV or raw LE f32 samples);
//!    receiving it starts the job
//! 3. **Results**: the server streams `progress` and `update` messages and
//!    ends the job with one `complete` or `error`
//!
//! Heartbeats use protocol-level ping/pong frames, never JSON messages, so
//! they cannot be mistaken for job output.

use crate::audio;
use crate::protocol::{JobRequest, JobSink, WorkerMessage};
use crate::state::AppState;
use crate::transcription::orchestrator;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One client connection on the job channel.
pub struct TranscriptionSocket {
    state: AppState,

    /// Job request waiting for its audio frame
    pending: Option<JobRequest>,

    last_heartbeat: Instant,
}

impl TranscriptionSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            pending: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_job_request(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<JobRequest>(text) {
            Ok(request) => {
                debug!(
                    "Job request queued: model={}, device={}",
                    request.model, request.device
                );
                self.pending = Some(request);
            }
            Err(err) => {
                warn!("Rejected malformed job request: {}", err);
                send_message(
                    ctx,
                    &WorkerMessage::error(json!(format!("Invalid job request: {}", err))),
                );
            }
        }
    }

    /// A binary frame is this job's audio; decoding it successfully starts
    /// the job on a background task.
    fn handle_audio_frame(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let request = match self.pending.take() {
            Some(request) => request,
            None => {
                send_message(
                    ctx,
                    &WorkerMessage::error(json!("No job request received before audio")),
                );
                return;
            }
        };

        let max_bytes = self.state.get_config().jobs.max_audio_bytes;
        if data.len() > max_bytes {
            send_message(
                ctx,
                &WorkerMessage::error(json!(format!(
                    "Audio frame of {} bytes exceeds the {} byte limit",
                    data.len(),
                    max_bytes
                ))),
            );
            return;
        }

        let samples = match audio::decode_frame(data) {
            Ok(samples) => samples,
            Err(err) => {
                send_message(ctx, &WorkerMessage::error(json!(err.to_string())));
                return;
            }
        };

        debug!(
            "Starting job with {:.1}s of audio",
            samples.len() as f64 / audio::SAMPLE_RATE as f64
        );
        self.state.job_started();

        let sink: Arc<dyn JobSink> = Arc::new(ActorSink {
            addr: ctx.address(),
            state: self.state.clone(),
        });
        let pipelines = Arc::clone(&self.state.pipelines);

        tokio::spawn(async move {
            orchestrator::process_job(&pipelines, &request, &samples, sink).await;
        });
    }
}

/// Forwards worker messages to the connection actor and keeps the job
/// counters in step with the terminal message of each job.
struct ActorSink {
    addr: Addr<TranscriptionSocket>,
    state: AppState,
}

impl JobSink for ActorSink {
    fn send(&self, message: WorkerMessage) {
        match &message {
            WorkerMessage::Complete { .. } => self.state.job_completed(),
            WorkerMessage::Error { .. } => self.state.job_failed(),
            _ => {}
        }
        match serde_json::to_string(&message) {
            Ok(text) => self.addr.do_send(Outbound(text)),
            Err(err) => error!("Failed to serialize worker message: {}", err),
        }
    }
}

/// Serialized worker message on its way out to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(String);

impl Actor for TranscriptionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Job channel connection opened");

        let timeout = Duration::from_secs(self.state.get_config().jobs.heartbeat_timeout_secs);
        ctx.run_interval(HEARTBEAT_INTERVAL, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!("Job channel heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Job channel connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscriptionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_job_request(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.handle_audio_frame(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Job channel closed by client: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for TranscriptionSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// HTTP upgrade handler for `/ws/transcribe`.
pub async fn transcribe_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New job channel connection from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(TranscriptionSocket::new(state.get_ref().clone()), &req, stream)
}

/// Send one worker message directly from the actor context.
fn send_message(ctx: &mut ws::WebsocketContext<TranscriptionSocket>, message: &WorkerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => ctx.text(text),
        Err(err) => error!("Failed to serialize worker message: {}", err),
    }
}
