//! Kernel package selection.

/// Debian kernel package name for a target architecture.
///
/// Kernel packages are not named after the dpkg architecture on every port:
/// 32-bit x86 kernels are `686`, armhf uses the multiplatform `armmp`
/// flavour and ppc64el spells the architecture out.
pub fn kernel_package(architecture: &str) -> String {
    let kernel_arch = match architecture {
        "i386" => "686",
        "armhf" => "armmp",
        "ppc64el" => "powerpc64le",
        other => other,
    };
    format!("linux-image-{kernel_arch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_ports() {
        assert_eq!(kernel_package("amd64"), "linux-image-amd64");
        assert_eq!(kernel_package("i386"), "linux-image-686");
        assert_eq!(kernel_package("armhf"), "linux-image-armmp");
        assert_eq!(kernel_package("ppc64el"), "linux-image-powerpc64le");
        assert_eq!(kernel_package("arm64"), "linux-image-arm64");
    }
}
