//! Maps the host platform to the coordinate triple used for artefact lookup.
//!
//! The binary repository keys archives by `(os, arch, version)`, where the
//! tags follow the Go toolchain's naming (`darwin`/`amd64`/`386`). ARM hosts
//! carry sub-variant adornments and Alpine hosts a `-alpine` suffix, so the
//! resolver takes the machine name and libc flavour as explicit inputs
//! rather than probing the host at point of use; tests exercise every
//! `(os, arch)` pair without one.

use std::fmt;

/// The `(os, arch, version)` key under which binary archives are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlatformTriple {
    pub(crate) os: String,
    pub(crate) arch: String,
    pub(crate) version: String,
}

impl PlatformTriple {
    /// File name of the cached inner archive for this triple.
    pub(crate) fn archive_name(&self) -> String {
        format!(
            "embedded-postgres-binaries-{}-{}-{}.txz",
            self.os, self.arch, self.version
        )
    }
}

impl fmt::Display for PlatformTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.os, self.arch, self.version)
    }
}

/// Resolves the coordinate triple for a host.
///
/// `machine` is the kernel's machine name (`uname -m`) and `alpine` reports
/// whether the host links against musl via an Alpine userland. The rules are
/// ordered; the first match per architecture wins:
///
/// - `linux`/`arm64` publishes as `arm64v8`.
/// - `linux`/`arm` splits on the machine name into `arm32v7` or `arm32v6`.
/// - Alpine hosts take an `-alpine` suffix on the final arch tag.
/// - `darwin`/`arm64` has native builds from 14.2 onwards; older versions
///   fall back to the `amd64` build under Rosetta.
pub(crate) fn resolve(
    os: &str,
    arch: &str,
    version: &str,
    machine: &str,
    alpine: bool,
) -> PlatformTriple {
    let mut arch = arch.to_owned();

    if os == "linux" {
        if arch == "arm64" {
            arch = "arm64v8".to_owned();
        } else if arch == "arm" {
            if machine.starts_with("armv7") {
                arch = "arm32v7".to_owned();
            } else if machine.starts_with("armv6") {
                arch = "arm32v6".to_owned();
            }
        }

        if alpine {
            arch.push_str("-alpine");
        }
    }

    if os == "darwin" && arch == "arm64" {
        if at_least(version, 14, 2) {
            arch = "arm64v8".to_owned();
        } else {
            // No native build before 14.2; Rosetta runs the amd64 one.
            arch = "amd64".to_owned();
        }
    }

    PlatformTriple {
        os: os.to_owned(),
        arch,
        version: version.to_owned(),
    }
}

/// Resolves the triple for the current host.
pub(crate) fn host(version: &str) -> PlatformTriple {
    resolve(
        os_tag(std::env::consts::OS),
        arch_tag(std::env::consts::ARCH),
        version,
        &uname_machine(),
        is_alpine(),
    )
}

/// Translates Rust's OS name into the repository's tag.
fn os_tag(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

/// Translates Rust's architecture name into the repository's tag.
fn arch_tag(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        other => other,
    }
}

/// Compares the `major.minor` prefix of a dotted version against a floor.
///
/// Registry versions are always dotted decimals; anything unparsable
/// compares as zero.
fn at_least(version: &str, major: u32, minor: u32) -> bool {
    let mut parts = version.split('.');
    let got_major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let got_minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (got_major, got_minor) >= (major, minor)
}

/// Reports the kernel's machine name, used to split 32-bit ARM sub-variants.
fn uname_machine() -> String {
    #[cfg(unix)]
    {
        std::process::Command::new("uname")
            .arg("-m")
            .output()
            .ok()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_owned())
            .unwrap_or_default()
    }
    #[cfg(not(unix))]
    {
        String::new()
    }
}

/// Detects an Alpine userland, which needs the musl-linked binaries.
fn is_alpine() -> bool {
    std::path::Path::new("/etc/alpine-release").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(os: &str, arch: &str) -> PlatformTriple {
        resolve(os, arch, "15.8.0", "x86_64", false)
    }

    #[test]
    fn common_platforms_pass_through_unchanged() {
        for (os, arch) in [
            ("linux", "amd64"),
            ("linux", "386"),
            ("linux", "ppc64le"),
            ("darwin", "amd64"),
            ("windows", "amd64"),
            ("windows", "386"),
            ("freebsd", "amd64"),
        ] {
            let triple = plain(os, arch);
            assert_eq!(triple.os, os);
            assert_eq!(triple.arch, arch);
        }
    }

    #[test]
    fn linux_arm64_publishes_as_arm64v8() {
        assert_eq!(plain("linux", "arm64").arch, "arm64v8");
    }

    #[test]
    fn linux_arm_splits_on_machine_name() {
        let v7 = resolve("linux", "arm", "15.8.0", "armv7l", false);
        assert_eq!(v7.arch, "arm32v7");

        let v6 = resolve("linux", "arm", "15.8.0", "armv6l", false);
        assert_eq!(v6.arch, "arm32v6");

        let unknown = resolve("linux", "arm", "15.8.0", "armv8l", false);
        assert_eq!(unknown.arch, "arm", "unrecognised machine stays generic");
    }

    #[test]
    fn alpine_suffixes_the_arch_tag() {
        let amd = resolve("linux", "amd64", "15.8.0", "x86_64", true);
        assert_eq!(amd.arch, "amd64-alpine");

        let arm = resolve("linux", "arm64", "15.8.0", "aarch64", true);
        assert_eq!(arm.arch, "arm64v8-alpine");
    }

    #[test]
    fn alpine_is_ignored_outside_linux() {
        let triple = resolve("darwin", "amd64", "15.8.0", "x86_64", true);
        assert_eq!(triple.arch, "amd64");
    }

    #[test]
    fn darwin_arm64_uses_native_builds_from_14_2() {
        for version in ["14.2.0", "15.8.0", "16.4.0"] {
            let triple = resolve("darwin", "arm64", version, "arm64", false);
            assert_eq!(triple.arch, "arm64v8", "version {version}");
        }
    }

    #[test]
    fn darwin_arm64_falls_back_to_rosetta_before_14_2() {
        for version in ["14.1.0", "13.16.0", "9.6.24"] {
            let triple = resolve("darwin", "arm64", version, "arm64", false);
            assert_eq!(triple.arch, "amd64", "version {version}");
        }
    }

    #[test]
    fn archive_name_embeds_the_full_triple() {
        let triple = resolve("linux", "arm64", "16.4.0", "aarch64", true);
        assert_eq!(
            triple.archive_name(),
            "embedded-postgres-binaries-linux-arm64v8-alpine-16.4.0.txz"
        );
    }
}
