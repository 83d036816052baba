//! Platform and architecture identification, and native file naming.

use std::fmt;
use std::str::FromStr;

use super::error::{FfiError, FfiResult};

/// Operating systems a library declaration can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Linux,
    Android,
    MacOs,
    Ios,
}

impl Platform {
    /// Platform of the running process
    pub fn current() -> FfiResult<Self> {
        if cfg!(target_os = "windows") {
            Ok(Platform::Windows)
        } else if cfg!(target_os = "android") {
            Ok(Platform::Android)
        } else if cfg!(target_os = "linux") {
            Ok(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Ok(Platform::MacOs)
        } else if cfg!(target_os = "ios") {
            Ok(Platform::Ios)
        } else {
            Err(FfiError::UnsupportedPlatform(std::env::consts::OS.to_string()))
        }
    }
}

impl FromStr for Platform {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "windows" | "win" | "win32" | "win64" => Ok(Platform::Windows),
            "linux" => Ok(Platform::Linux),
            "android" => Ok(Platform::Android),
            "macos" | "osx" | "darwin" => Ok(Platform::MacOs),
            "ios" => Ok(Platform::Ios),
            other => Err(FfiError::UnsupportedPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Android => "android",
            Platform::MacOs => "macos",
            Platform::Ios => "ios",
        };
        f.write_str(name)
    }
}

/// Pointer width of the target process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    pub fn current() -> FfiResult<Self> {
        match std::mem::size_of::<usize>() {
            4 => Ok(Bitness::X86),
            8 => Ok(Bitness::X64),
            _ => Err(FfiError::UnsupportedArchitecture(
                std::env::consts::ARCH.to_string(),
            )),
        }
    }
}

impl FromStr for Bitness {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "x86" | "32" | "i686" => Ok(Bitness::X86),
            "x64" | "64" | "x86_64" | "amd64" | "arm64" | "aarch64" => Ok(Bitness::X64),
            other => Err(FfiError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitness::X86 => f.write_str("x86"),
            Bitness::X64 => f.write_str("x64"),
        }
    }
}

/// Construct the platform-specific library filename
pub fn platform_specific_name(base: &str, platform: Platform) -> String {
    match platform {
        Platform::Windows => format!("{}.dll", base),
        Platform::Linux | Platform::Android => format!("lib{}.so", base),
        Platform::MacOs => format!("lib{}.dylib", base),
        Platform::Ios => format!("lib{}.a", base),
    }
}

/// Same as [`platform_specific_name`] but for a platform given by name
pub fn platform_specific_name_for(base: &str, platform: &str) -> FfiResult<String> {
    Ok(platform_specific_name(base, platform.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_specific_names() {
        assert_eq!(platform_specific_name("zip", Platform::Windows), "zip.dll");
        assert_eq!(platform_specific_name("zip", Platform::Linux), "libzip.so");
        assert_eq!(platform_specific_name("zip", Platform::Android), "libzip.so");
        assert_eq!(platform_specific_name("zip", Platform::MacOs), "libzip.dylib");
        assert_eq!(platform_specific_name("zip", Platform::Ios), "libzip.a");
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let err = platform_specific_name_for("zip", "plan9").unwrap_err();
        assert!(matches!(err, FfiError::UnsupportedPlatform(ref p) if p == "plan9"));
    }

    #[test]
    fn test_current_host_is_recognized() {
        #[cfg(any(
            target_os = "windows",
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios"
        ))]
        assert!(Platform::current().is_ok());
        assert!(Bitness::current().is_ok());
    }

    #[test]
    fn test_bitness_parsing() {
        assert_eq!("x64".parse::<Bitness>().unwrap(), Bitness::X64);
        assert_eq!("32".parse::<Bitness>().unwrap(), Bitness::X86);
        assert!(matches!(
            "mips".parse::<Bitness>(),
            Err(FfiError::UnsupportedArchitecture(_))
        ));
    }
}
