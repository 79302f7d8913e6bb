//! Host RAM probes.
//!
//! Two consumers share these: device capability snapshots read total RAM,
//! the runtime's reclaim loop reads available RAM. Platforms without a
//! usable probe answer `None`, and both consumers treat unknown as "no
//! constraint" rather than guessing.

/// Total physical RAM in bytes, when the platform exposes it.
pub fn total_ram_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        meminfo_bytes("MemTotal")
    }
    #[cfg(target_os = "macos")]
    {
        sysctl_u64("hw.memsize")
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// RAM the OS could hand out right now, when the platform exposes it.
pub fn available_ram_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        meminfo_bytes("MemAvailable")
    }
    #[cfg(target_os = "macos")]
    {
        sysctl_u64("vm.page_free_count")?.checked_mul(sysctl_u64("hw.pagesize")?)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// One field of `/proc/meminfo`, converted from KiB to bytes.
#[cfg(target_os = "linux")]
fn meminfo_bytes(field: &str) -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let rest = text
        .lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))?;
    let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
    kib.checked_mul(1024)
}

#[cfg(target_os = "macos")]
fn sysctl_u64(name: &str) -> Option<u64> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", name])
        .output()
        .ok()?;
    std::str::from_utf8(&output.stdout).ok()?.trim().parse().ok()
}
