use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let pipeline = state.pipelines.status().await;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "asr-stream-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "jobs": {
            "received": metrics.jobs_received,
            "completed": metrics.jobs_completed,
            "failed": metrics.jobs_failed,
            "active": metrics.active_jobs
        },
        "pipeline": pipeline_status_json(&pipeline),
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let pipeline = state.pipelines.status().await;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "jobs": {
            "received": metrics.jobs_received,
            "completed": metrics.jobs_completed,
            "failed": metrics.jobs_failed,
            "active": metrics.active_jobs,
            "failure_rate": if metrics.jobs_received > 0 {
                metrics.jobs_failed as f64 / metrics.jobs_received as f64
            } else {
                0.0
            },
            "jobs_per_second": if uptime_seconds > 0 {
                metrics.jobs_received as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "pipeline": pipeline_status_json(&pipeline),
        "memory": get_memory_info()
    }))
}

fn pipeline_status_json(
    status: &Option<crate::transcription::manager::PipelineStatus>,
) -> serde_json::Value {
    match status {
        Some(status) => json!({
            "model": status.descriptor.model_id,
            "device": status.descriptor.device.to_string(),
            "quantized": status.descriptor.quantized,
            "ready": status.ready
        }),
        None => json!({ "loaded": false }),
    }
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
