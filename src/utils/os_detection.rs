use serde::{Deserialize, Serialize};

use crate::installation::linux_parsers::{parse_os_release, LinuxDistro};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Armhf,
    Unknown,
}

impl Architecture {
    /// Map a `uname -m` / Rust target arch string.
    pub fn from_machine(machine: &str) -> Self {
        match machine.trim() {
            "x86_64" | "amd64" => Architecture::X86_64,
            "aarch64" | "arm64" => Architecture::Aarch64,
            "arm" | "armv7l" | "armhf" => Architecture::Armhf,
            _ => Architecture::Unknown,
        }
    }

    /// Spellings used by release assets and Debian packages for this architecture.
    pub fn asset_aliases(&self) -> &'static [&'static str] {
        match self {
            Architecture::X86_64 => &["x86_64", "amd64", "x64"],
            Architecture::Aarch64 => &["aarch64", "arm64"],
            Architecture::Armhf => &["armhf", "armv7"],
            Architecture::Unknown => &[],
        }
    }
}

/// Detect the architecture this binary runs on
pub fn detect_arch() -> Architecture {
    Architecture::from_machine(std::env::consts::ARCH)
}

/// Best-effort distribution detection from `/etc/os-release`.
pub fn detect_distro() -> Option<LinuxDistro> {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .map(|contents| parse_os_release(&contents))
}

/// True when the distribution is Debian-based (apt + dpkg available by convention).
pub fn is_debian_family(distro: &LinuxDistro) -> bool {
    distro.id == "debian"
        || distro.id == "ubuntu"
        || distro.id_like.iter().any(|l| l == "debian" || l == "ubuntu")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_strings_map_to_arch() {
        assert_eq!(Architecture::from_machine("x86_64"), Architecture::X86_64);
        assert_eq!(Architecture::from_machine("arm64"), Architecture::Aarch64);
        assert_eq!(Architecture::from_machine("armv7l"), Architecture::Armhf);
        assert_eq!(Architecture::from_machine("riscv64"), Architecture::Unknown);
    }

    #[test]
    fn aliases_cover_debian_spelling() {
        assert!(Architecture::X86_64.asset_aliases().contains(&"amd64"));
        assert!(Architecture::Aarch64.asset_aliases().contains(&"arm64"));
        assert!(Architecture::Unknown.asset_aliases().is_empty());
    }

    #[test]
    fn debian_family_detection() {
        let mint = parse_os_release("ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n");
        assert!(is_debian_family(&mint));
        let fedora = parse_os_release("ID=fedora\n");
        assert!(!is_debian_family(&fedora));
    }
}
