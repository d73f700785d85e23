//! Hardware detection command.
//!
//! Reports the capacity the resource gate sees (memory, cores, GPU) plus OS
//! details, and recommends a local runtime and quantization level.

use serde::Serialize;
use sysinfo::System;

use crate::inference::resources::GpuInfo;
use crate::AppState;

const MB_PER_GB: f64 = 1024.0;

/// Hardware profile of the local machine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    pub cpu_cores: u32,
    pub ram_total_gb: f64,
    pub ram_available_gb: f64,
    pub os_name: String,
    pub os_version: String,
    pub arch: String,
    pub gpu: Option<GpuInfo>,
    pub recommended_runtime: String,
    pub recommended_quantization: String,
    /// Largest on-disk model (MB) the gate would admit right now.
    pub max_local_model_mb: u64,
    pub active_local_inferences: usize,
    pub max_concurrent_local_inferences: usize,
}

fn is_apple_silicon() -> bool {
    cfg!(target_os = "macos") && std::env::consts::ARCH == "aarch64"
}

/// Recommend a local inference runtime for the detected hardware.
fn recommend_runtime(gpu: Option<&GpuInfo>) -> &'static str {
    if is_apple_silicon() {
        return "MLX";
    }
    match gpu {
        Some(g) if g.vendor.eq_ignore_ascii_case("nvidia") => "vLLM",
        _ => "llama.cpp",
    }
}

/// Recommend a quantization level based on total RAM.
fn recommend_quantization(ram_total_gb: f64) -> &'static str {
    if ram_total_gb >= 32.0 {
        "Q8_0"
    } else if ram_total_gb >= 16.0 {
        "Q4_K_M"
    } else {
        "Q4_0"
    }
}

/// Invert the gate's footprint estimate: the biggest model file that fits.
fn max_model_mb(available_mb: u64, multiplier: f64, min_memory_mb: u64) -> u64 {
    if available_mb < min_memory_mb || multiplier <= 0.0 {
        return 0;
    }
    (available_mb as f64 / multiplier).floor() as u64
}

fn round_gb(mb: u64) -> f64 {
    (mb as f64 / MB_PER_GB * 10.0).round() / 10.0
}

/// Detect hardware capabilities of the local machine.
pub fn detect_hardware(state: &AppState) -> HardwareInfo {
    let gate = state.dispatcher.gate();
    let snapshot = gate.snapshot();
    let settings = gate.settings();

    let ram_total_gb = round_gb(snapshot.total_memory_mb);
    let info = HardwareInfo {
        cpu_cores: snapshot.cpu_cores,
        ram_total_gb,
        ram_available_gb: round_gb(snapshot.free_memory_mb),
        os_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
        os_version: System::os_version().unwrap_or_else(|| "Unknown".to_string()),
        arch: std::env::consts::ARCH.to_string(),
        recommended_runtime: recommend_runtime(snapshot.gpu.as_ref()).to_string(),
        recommended_quantization: recommend_quantization(ram_total_gb).to_string(),
        max_local_model_mb: max_model_mb(
            gate.available_memory_mb(),
            settings.memory_multiplier,
            settings.min_memory_mb,
        ),
        active_local_inferences: gate.active(),
        max_concurrent_local_inferences: gate.max_concurrent(),
        gpu: snapshot.gpu,
    };

    tracing::info!(
        cpu_cores = info.cpu_cores,
        ram_total_gb = info.ram_total_gb,
        gpu = info.gpu.as_ref().map(|g| g.model.as_str()).unwrap_or("none"),
        runtime = %info.recommended_runtime,
        "hardware detected"
    );
    info
}
