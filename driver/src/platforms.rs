/* -------------------------------------------------------------------------- *\
 *        Apache 2.0 License Copyright © 2023-2025 The Kubuild Authors        *
 *                                                                            *
 *         +-------------------------------------------------------+          *
 *         | ██╗  ██╗██╗   ██╗██████╗ ██╗   ██╗██╗██╗     ██████╗  |          *
 *         | ██║ ██╔╝██║   ██║██╔══██╗██║   ██║██║██║     ██╔══██╗ |          *
 *         | █████╔╝ ██║   ██║██████╔╝██║   ██║██║██║     ██║  ██║ |          *
 *         | ██╔═██╗ ██║   ██║██╔══██╗██║   ██║██║██║     ██║  ██║ |          *
 *         | ██║  ██╗╚██████╔╝██████╔╝╚██████╔╝██║███████╗██████╔╝ |          *
 *         | ╚═╝  ╚═╝ ╚═════╝ ╚═════╝  ╚═════╝ ╚═╝╚══════╝╚═════╝  |          *
 *         +-------------------------------------------------------+          *
 *                                                                            *
 *                   In-Cluster Image Builds for Kubernetes                   *
 *                                                                            *
 * -------------------------------------------------------------------------- *
 *                                                                            *
 *   Licensed under the Apache License, Version 2.0 (the "License");          *
 *   you may not use this file except in compliance with the License.         *
 *   You may obtain a copy of the License at                                  *
 *                                                                            *
 *       http://www.apache.org/licenses/LICENSE-2.0                           *
 *                                                                            *
 *   Unless required by applicable law or agreed to in writing, software      *
 *   distributed under the License is distributed on an "AS IS" BASIS,        *
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. *
 *   See the License for the specific language governing permissions and      *
 *   limitations under the License.                                           *
 *                                                                            *
\* -------------------------------------------------------------------------- */

//! Platform parsing and normalization.
//!
//! Platform strings compare by their normalized form everywhere (pod
//! filtering, driver resolution), so aliases like `x86_64` and `aarch64`
//! match the daemon's canonical names.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid platform {0:?}")]
pub struct PlatformParseError(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: String,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: String::new(),
        }
        .normalize()
    }

    /// Canonical form: known architecture aliases collapse, arm defaults
    /// to v7, and the redundant arm64/v8 variant drops.
    pub fn normalize(mut self) -> Self {
        if self.os.is_empty() {
            self.os = "linux".to_string();
        }
        let (arch, variant) = match (
            self.architecture.as_str(),
            self.variant.as_str(),
        ) {
            ("x86_64", _) | ("x86-64", _) | ("amd64", _) => ("amd64", ""),
            ("aarch64", _) | ("arm64", "") | ("arm64", "v8") => {
                ("arm64", "")
            }
            ("arm64", v) => ("arm64", v),
            ("armhf", _) | ("arm", "") => ("arm", "v7"),
            ("armel", _) => ("arm", "v6"),
            ("arm", v) => ("arm", v),
            (a, v) => (a, v),
        };
        self.architecture = arch.to_string();
        self.variant = variant.to_string();
        self
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variant.is_empty() {
            write!(f, "{}/{}", self.os, self.architecture)
        } else {
            write!(f, "{}/{}/{}", self.os, self.architecture, self.variant)
        }
    }
}

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PlatformParseError(s.to_string()));
        }
        let parts: Vec<&str> = s.split('/').collect();
        let platform = match parts.as_slice() {
            [arch] => Platform {
                os: String::new(),
                architecture: (*arch).to_string(),
                variant: String::new(),
            },
            [os, arch] => Platform {
                os: (*os).to_string(),
                architecture: (*arch).to_string(),
                variant: String::new(),
            },
            [os, arch, variant] => Platform {
                os: (*os).to_string(),
                architecture: (*arch).to_string(),
                variant: (*variant).to_string(),
            },
            _ => return Err(PlatformParseError(s.to_string())),
        };
        Ok(platform.normalize())
    }
}

/// Parse a list of platform specs, splitting comma-joined entries.
pub fn parse_list(
    specs: &[String],
) -> Result<Vec<Platform>, PlatformParseError> {
    let mut out = Vec::new();
    for spec in specs {
        for part in spec.split(',') {
            if part.is_empty() {
                continue;
            }
            out.push(part.parse()?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_arch() {
        let p: Platform = "linux/amd64".parse().expect("parse");
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert_eq!(p.to_string(), "linux/amd64");
    }

    #[test]
    fn test_arch_only_defaults_to_linux() {
        let p: Platform = "arm64".parse().expect("parse");
        assert_eq!(p.to_string(), "linux/arm64");
    }

    #[test]
    fn test_aliases_normalize() {
        assert_eq!(
            "linux/x86_64".parse::<Platform>().expect("parse"),
            "linux/amd64".parse::<Platform>().expect("parse"),
        );
        assert_eq!(
            "linux/aarch64".parse::<Platform>().expect("parse"),
            "linux/arm64/v8".parse::<Platform>().expect("parse"),
        );
    }

    #[test]
    fn test_arm_defaults_to_v7() {
        let p: Platform = "linux/arm".parse().expect("parse");
        assert_eq!(p.to_string(), "linux/arm/v7");
    }

    #[test]
    fn test_parse_list_splits_commas() {
        let list = parse_list(&[
            "linux/amd64,linux/arm64".to_string(),
            "linux/arm/v6".to_string(),
        ])
        .expect("parse");
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_empty_spec_is_error() {
        assert!("".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }
}
