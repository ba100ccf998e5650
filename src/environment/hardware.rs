#![forbid(unsafe_code)]

use sysinfo::{CpuRefreshKind, RefreshKind, System};

use crate::entity::HardwareInfo;

/// Fingerprint of the machine this process runs on.
#[must_use]
pub fn capture() -> HardwareInfo {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    let processor = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_owned())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| std::env::consts::ARCH.to_owned());
    HardwareInfo {
        system: System::name().unwrap_or_else(|| std::env::consts::OS.to_owned()),
        node: System::host_name().unwrap_or_default(),
        release: System::kernel_version().unwrap_or_default(),
        version: System::os_version().unwrap_or_default(),
        machine: std::env::consts::ARCH.to_owned(),
        processor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_is_stable_within_a_process() {
        let a = capture();
        assert!(!a.system.is_empty());
        assert_eq!(a.machine, std::env::consts::ARCH);
        assert_eq!(a, capture());
    }
}
