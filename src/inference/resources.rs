//! Admission control for local-model inference.
//!
//! [`ResourceGate::admit`] decides synchronously whether a local inference may
//! start: it never queues. Admission checks and the active-count increment
//! happen under one lock, so the configured concurrency cap holds under
//! concurrent callers. A [`ResourceReservation`] releases itself on drop.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use sysinfo::System;
use thiserror::Error;

use super::config::ResourceSettings;

// ─── System probe ────────────────────────────────────────────────────────────

/// GPU information detected on the system. Advisory only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub vendor: String,
    pub model: String,
}

/// Point-in-time view of machine capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSnapshot {
    pub free_memory_mb: u64,
    pub total_memory_mb: u64,
    pub cpu_cores: u32,
    pub gpu: Option<GpuInfo>,
}

/// Source of system capacity readings.
pub trait SystemProbe: Send + Sync {
    fn snapshot(&self) -> SystemSnapshot;
}

/// Reads capacity from the host via `sysinfo`.
///
/// The GPU is detected once at construction; memory is refreshed on every
/// snapshot.
pub struct SysinfoProbe {
    system: Mutex<System>,
    gpu: Option<GpuInfo>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            gpu: detect_gpu(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn snapshot(&self) -> SystemSnapshot {
        let (free, total) = match self.system.lock() {
            Ok(mut sys) => {
                sys.refresh_memory();
                (sys.available_memory(), sys.total_memory())
            }
            Err(_) => (0, 0),
        };
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        SystemSnapshot {
            free_memory_mb: free / (1024 * 1024),
            total_memory_mb: total / (1024 * 1024),
            cpu_cores,
            gpu: self.gpu.clone(),
        }
    }
}

/// Detect whether the system has Apple Silicon.
fn is_apple_silicon() -> bool {
    cfg!(target_os = "macos") && std::env::consts::ARCH == "aarch64"
}

/// Detect GPU information.
///
/// - macOS Apple Silicon: reports the integrated GPU.
/// - Linux: parses `lspci` output for VGA / 3D controllers.
fn detect_gpu() -> Option<GpuInfo> {
    if is_apple_silicon() {
        return Some(GpuInfo {
            vendor: "Apple".to_string(),
            model: "Apple Silicon (Unified Memory)".to_string(),
        });
    }

    #[cfg(target_os = "linux")]
    {
        let output = std::process::Command::new("lspci").output().ok()?;
        parse_lspci_gpu(&String::from_utf8_lossy(&output.stdout))
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Pick the first display controller out of `lspci` output.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_lspci_gpu(text: &str) -> Option<GpuInfo> {
    let line = text
        .lines()
        .find(|l| l.contains("VGA") || l.contains("3D controller"))?;
    // Format: "01:00.0 VGA compatible controller: NVIDIA Corporation ..."
    let desc = line.split_once(": ").map(|(_, d)| d).unwrap_or(line).trim();
    let lower = desc.to_lowercase();
    let vendor = if lower.contains("nvidia") {
        "NVIDIA"
    } else if lower.contains("amd") || lower.contains("radeon") {
        "AMD"
    } else if lower.contains("intel") {
        "Intel"
    } else {
        "Unknown"
    };
    Some(GpuInfo {
        vendor: vendor.to_string(),
        model: desc.to_string(),
    })
}

// ─── Admission ───────────────────────────────────────────────────────────────

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionRejection {
    /// The concurrency cap is reached. Retry later.
    #[error("local model busy ({active}/{max} inferences running), retry later")]
    Busy { active: usize, max: usize },

    /// Not enough free memory for the model's estimated footprint.
    #[error("insufficient memory: model needs ~{required_mb} MB, {available_mb} MB available")]
    InsufficientMemory { required_mb: u64, available_mb: u64 },
}

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    reserved_mb: u64,
}

struct GateShared {
    settings: ResourceSettings,
    state: Mutex<GateState>,
}

impl GateShared {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        // The state is two counters; a poisoned lock still holds valid numbers.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, memory_mb: u64) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        state.reserved_mb = state.reserved_mb.saturating_sub(memory_mb);
        tracing::debug!(
            active = state.active,
            reserved_mb = state.reserved_mb,
            "released local inference reservation"
        );
    }
}

/// Admission control for local inference.
pub struct ResourceGate {
    shared: Arc<GateShared>,
    probe: Arc<dyn SystemProbe>,
}

impl ResourceGate {
    /// Build a gate. `max_concurrent` is raised to 1 if it is 0.
    pub fn new(mut settings: ResourceSettings, probe: Arc<dyn SystemProbe>) -> Self {
        settings.max_concurrent = settings.max_concurrent.max(1);
        Self {
            shared: Arc::new(GateShared {
                settings,
                state: Mutex::new(GateState::default()),
            }),
            probe,
        }
    }

    /// Gate backed by the host's real capacity.
    pub fn with_system_probe(settings: ResourceSettings) -> Self {
        Self::new(settings, Arc::new(SysinfoProbe::new()))
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.settings.max_concurrent
    }

    pub fn settings(&self) -> &ResourceSettings {
        &self.shared.settings
    }

    /// Current host capacity as seen by the probe.
    pub fn snapshot(&self) -> SystemSnapshot {
        self.probe.snapshot()
    }

    /// Memory (MB) still available to new reservations right now.
    pub fn available_memory_mb(&self) -> u64 {
        let free = self.probe.snapshot().free_memory_mb;
        free.saturating_sub(self.shared.settings.safety_buffer_mb)
            .saturating_sub(self.shared.lock().reserved_mb)
    }

    /// Number of currently allocated reservations.
    pub fn active(&self) -> usize {
        self.shared.lock().active
    }

    /// Memory (MB) a model of `model_size_mb` on disk is expected to use live.
    ///
    /// On-disk size underestimates live memory, so it is scaled by the
    /// configured multiplier and floored at the configured minimum.
    pub fn estimate_footprint_mb(&self, model_size_mb: u64) -> u64 {
        let settings = &self.shared.settings;
        let scaled = (model_size_mb as f64 * settings.memory_multiplier).ceil() as u64;
        scaled.max(settings.min_memory_mb)
    }

    /// Try to reserve capacity for one local inference. Never blocks.
    pub fn admit(&self, model_size_mb: u64) -> Result<ResourceReservation, AdmissionRejection> {
        let required_mb = self.estimate_footprint_mb(model_size_mb);
        let snapshot = self.probe.snapshot();

        let mut reservation = ResourceReservation {
            memory_mb: required_mb,
            cpu_cores: (snapshot.cpu_cores / self.max_concurrent().max(1) as u32).max(1),
            uses_gpu: snapshot.gpu.is_some(),
            allocated: false,
            gate: Arc::clone(&self.shared),
        };

        let mut state = self.shared.lock();
        let max = self.shared.settings.max_concurrent;
        if state.active >= max {
            tracing::warn!(active = state.active, max, "local admission rejected: busy");
            return Err(AdmissionRejection::Busy {
                active: state.active,
                max,
            });
        }

        // Free memory already drops once admitted predictors load weights, so
        // those reservations are counted twice until they release.
        let available_mb = snapshot
            .free_memory_mb
            .saturating_sub(self.shared.settings.safety_buffer_mb)
            .saturating_sub(state.reserved_mb);
        if required_mb > available_mb {
            tracing::warn!(
                required_mb,
                available_mb,
                free_mb = snapshot.free_memory_mb,
                "local admission rejected: insufficient memory"
            );
            return Err(AdmissionRejection::InsufficientMemory {
                required_mb,
                available_mb,
            });
        }

        state.active += 1;
        state.reserved_mb += required_mb;
        reservation.allocated = true;

        tracing::info!(
            active = state.active,
            max,
            memory_mb = required_mb,
            uses_gpu = reservation.uses_gpu,
            "admitted local inference"
        );
        Ok(reservation)
    }
}

/// Capacity held by one admitted local inference.
///
/// Released exactly once: by [`ResourceReservation::release`] or on drop,
/// whichever comes first.
pub struct ResourceReservation {
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub uses_gpu: bool,
    allocated: bool,
    gate: Arc<GateShared>,
}

impl ResourceReservation {
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Return the capacity to the gate. Subsequent calls are no-ops.
    pub fn release(&mut self) {
        if !self.allocated {
            return;
        }
        self.allocated = false;
        self.gate.release(self.memory_mb);
    }
}

impl Drop for ResourceReservation {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ResourceReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceReservation")
            .field("memory_mb", &self.memory_mb)
            .field("cpu_cores", &self.cpu_cores)
            .field("uses_gpu", &self.uses_gpu)
            .field("allocated", &self.allocated)
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Probe reporting fixed capacity.
    pub(crate) struct FixedProbe {
        pub free_memory_mb: u64,
        pub gpu: bool,
    }

    impl SystemProbe for FixedProbe {
        fn snapshot(&self) -> SystemSnapshot {
            SystemSnapshot {
                free_memory_mb: self.free_memory_mb,
                total_memory_mb: self.free_memory_mb * 2,
                cpu_cores: 8,
                gpu: self.gpu.then(|| GpuInfo {
                    vendor: "NVIDIA".into(),
                    model: "Test GPU".into(),
                }),
            }
        }
    }

    pub(crate) fn gate_with(max_concurrent: usize, free_memory_mb: u64) -> ResourceGate {
        let settings = ResourceSettings {
            max_concurrent,
            ..ResourceSettings::default()
        };
        ResourceGate::new(
            settings,
            Arc::new(FixedProbe {
                free_memory_mb,
                gpu: false,
            }),
        )
    }

    #[test]
    fn test_footprint_uses_multiplier_and_floor() {
        let gate = gate_with(4, 64_000);
        assert_eq!(gate.estimate_footprint_mb(100), 2_048);
        assert_eq!(gate.estimate_footprint_mb(4_000), 12_000);
    }

    #[test]
    fn test_admit_and_release() {
        let gate = gate_with(4, 64_000);
        let mut r = gate.admit(1_000).unwrap();
        assert!(r.is_allocated());
        assert_eq!(r.memory_mb, 3_000);
        assert_eq!(r.cpu_cores, 2);
        assert_eq!(gate.active(), 1);

        r.release();
        assert!(!r.is_allocated());
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn test_double_release_is_noop() {
        let gate = gate_with(4, 64_000);
        let _other = gate.admit(10).unwrap();
        let mut r = gate.admit(10).unwrap();
        assert_eq!(gate.active(), 2);

        r.release();
        r.release();
        drop(r);
        assert_eq!(gate.active(), 1, "second release and drop must not decrement");
    }

    #[test]
    fn test_drop_releases() {
        let gate = gate_with(1, 64_000);
        {
            let _r = gate.admit(10).unwrap();
            assert_eq!(gate.active(), 1);
        }
        assert_eq!(gate.active(), 0);
        assert!(gate.admit(10).is_ok());
    }

    #[test]
    fn test_busy_when_cap_reached() {
        let gate = gate_with(2, 64_000);
        let _a = gate.admit(10).unwrap();
        let _b = gate.admit(10).unwrap();
        let err = gate.admit(10).unwrap_err();
        assert_eq!(err, AdmissionRejection::Busy { active: 2, max: 2 });
        assert!(err.to_string().contains("retry later"));
        assert_eq!(gate.active(), 2);
    }

    #[test]
    fn test_zero_cap_is_raised_to_one() {
        let gate = gate_with(0, 64_000);
        assert_eq!(gate.max_concurrent(), 1);
        let _held = gate.admit(10).unwrap();
        assert_eq!(
            gate.admit(10).unwrap_err(),
            AdmissionRejection::Busy { active: 1, max: 1 }
        );
    }

    #[test]
    fn test_insufficient_memory() {
        // 4 GB free - 1 GB buffer = 3 GB; a 2 GB file needs 6 GB.
        let gate = gate_with(4, 4_096);
        let err = gate.admit(2_048).unwrap_err();
        assert_eq!(
            err,
            AdmissionRejection::InsufficientMemory {
                required_mb: 6_144,
                available_mb: 3_072,
            }
        );
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn test_reserved_memory_counts_against_later_admissions() {
        // 6 GB usable: one 3 GB footprint fits twice, not three times.
        let gate = gate_with(4, 7_168);
        let _a = gate.admit(1_024).unwrap();
        let _b = gate.admit(1_024).unwrap();
        assert!(matches!(
            gate.admit(1_024),
            Err(AdmissionRejection::InsufficientMemory { .. })
        ));
    }

    #[test]
    fn test_gpu_is_advisory() {
        let gate = ResourceGate::new(
            ResourceSettings::default(),
            Arc::new(FixedProbe {
                free_memory_mb: 64_000,
                gpu: true,
            }),
        );
        assert!(gate.admit(10).unwrap().uses_gpu);

        let cpu_only = gate_with(4, 64_000);
        assert!(!cpu_only.admit(10).unwrap().uses_gpu);
    }

    #[test]
    fn test_concurrent_admits_single_slot() {
        let gate = Arc::new(gate_with(1, 64_000));
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the winner's reservation alive until both have tried.
                    let result = gate.admit(10);
                    let ok = result.is_ok();
                    let busy = matches!(result, Err(AdmissionRejection::Busy { .. }));
                    (ok, busy, result.ok())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|(ok, _, _)| *ok).count();
        let busy = results.iter().filter(|(_, busy, _)| *busy).count();
        assert_eq!(admitted, 1);
        assert_eq!(busy, 1);
        assert_eq!(gate.active(), 1);

        drop(results);
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn test_never_exceeds_cap_under_contention() {
        let gate = Arc::new(gate_with(3, 1_000_000));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Ok(r) = gate.admit(1) {
                            peak.fetch_max(gate.active(), std::sync::atomic::Ordering::SeqCst);
                            drop(r);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn test_parse_lspci_gpu() {
        let text = "00:02.0 Host bridge: Intel Corporation\n\
                    01:00.0 VGA compatible controller: NVIDIA Corporation GA102 [GeForce RTX 3090]\n";
        let gpu = parse_lspci_gpu(text).unwrap();
        assert_eq!(gpu.vendor, "NVIDIA");
        assert!(gpu.model.contains("GeForce"));
        assert!(parse_lspci_gpu("00:02.0 Host bridge: Intel").is_none());
    }
}
