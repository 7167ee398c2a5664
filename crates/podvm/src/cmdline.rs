//! Kernel command line assembly.

/// Guest CPU architecture, explicit so the assembly is testable off-host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::X86_64
        } else {
            Self::Aarch64
        }
    }
}

/// Builds the guest kernel command line.
///
/// `fb_tunnels=none` stops the kernel from creating tunnel interfaces
/// nothing uses. The TSC hints only apply on x86_64; arm64 guests pick
/// their clocksource correctly on their own.
pub fn kernel_cmdline(arch: Arch, cli_mode: bool, kernel_debug: bool) -> String {
    let mut parts: Vec<&str> = vec!["console=hvc0", "fb_tunnels=none"];

    if arch == Arch::X86_64 {
        parts.push("clocksource=tsc");
        parts.push("tsc=reliable");
    }

    if !cli_mode {
        // Console output goes to a log file, no point colorizing it.
        parts.push("systemd.log_color=false");
    }
    parts.push("systemd.default_standard_output=journal+console");
    parts.push("systemd.default_standard_error=journal+console");

    if kernel_debug {
        parts.push("debug");
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_64_gets_tsc_hints() {
        let cmdline = kernel_cmdline(Arch::X86_64, false, false);
        assert!(cmdline.contains("clocksource=tsc tsc=reliable"));
    }

    #[test]
    fn aarch64_has_no_tsc_hints() {
        let cmdline = kernel_cmdline(Arch::Aarch64, false, false);
        assert!(!cmdline.contains("clocksource=tsc"));
        assert!(!cmdline.contains("tsc=reliable"));
    }

    #[test]
    fn starts_with_console_and_tunnel_options() {
        let cmdline = kernel_cmdline(Arch::Aarch64, false, false);
        assert!(cmdline.starts_with("console=hvc0 fb_tunnels=none"));
    }

    #[test]
    fn cli_mode_keeps_log_color() {
        let with_cli = kernel_cmdline(Arch::Aarch64, true, false);
        let without_cli = kernel_cmdline(Arch::Aarch64, false, false);
        assert!(!with_cli.contains("systemd.log_color=false"));
        assert!(without_cli.contains("systemd.log_color=false"));
    }

    #[test]
    fn systemd_output_always_reaches_console() {
        for arch in [Arch::X86_64, Arch::Aarch64] {
            let cmdline = kernel_cmdline(arch, true, false);
            assert!(cmdline.contains("systemd.default_standard_output=journal+console"));
            assert!(cmdline.contains("systemd.default_standard_error=journal+console"));
        }
    }

    #[test]
    fn debug_is_opt_in_and_last() {
        let quiet = kernel_cmdline(Arch::Aarch64, false, false);
        assert!(!quiet.ends_with("debug"));

        let noisy = kernel_cmdline(Arch::Aarch64, false, true);
        assert!(noisy.ends_with(" debug"));
    }
}
