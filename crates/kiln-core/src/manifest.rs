//! Language dependency manifests (requirements-style).

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const OPERATORS: [&str; 8] = ["===", "==", ">=", "<=", "~=", "!=", ">", "<"];

/// A named dependency with an optional version constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    /// Everything after the name: version specifiers, extras, markers.
    pub constraint: Option<String>,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{}{}", self.name, c),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Parsed dependency manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub dependencies: Vec<Dependency>,
    /// Installer options such as `--extra-index-url`, kept verbatim.
    pub options: Vec<String>,
}

impl DependencyManifest {
    /// Parse a requirements-style manifest, one dependency per line.
    pub fn parse(content: &str) -> Result<Self> {
        let mut manifest = Self::default();

        for (lineno, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('-') {
                manifest.options.push(line.to_string());
                continue;
            }

            let split_at = line
                .find(|c: char| {
                    c == '[' || c == ';' || c == ' ' || c == '\t' || "=<>!~".contains(c)
                })
                .unwrap_or(line.len());
            let (name, rest) = line.split_at(split_at);
            if !is_valid_name(name) {
                return Err(Error::Recipe(format!(
                    "line {}: invalid dependency name '{}'",
                    lineno + 1,
                    name
                )));
            }

            let rest = rest.trim();
            if !rest.is_empty()
                && !rest.starts_with('[')
                && !rest.starts_with(';')
                && !OPERATORS.iter().any(|op| rest.starts_with(op))
            {
                return Err(Error::Recipe(format!(
                    "line {}: invalid constraint '{}' for {}",
                    lineno + 1,
                    rest,
                    name
                )));
            }

            manifest.dependencies.push(Dependency {
                name: name.to_string(),
                constraint: (!rest.is_empty()).then(|| rest.to_string()),
            });
        }

        Ok(manifest)
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        let wanted = normalize(name);
        self.dependencies.iter().find(|d| normalize(&d.name) == wanted)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

fn strip_comment(line: &str) -> &str {
    // A '#' only starts a comment at line start or after whitespace (URLs keep fragments).
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace(['_', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirements() {
        let content = r#"
# Core deps
cloudpickle==0.4.0
exifread==2.1.2
numpy>=1.19   # pinned loosely
scipy
opencv-python ; sys_platform == "linux"
--extra-index-url https://example.org/simple
"#;
        let manifest = DependencyManifest::parse(content).unwrap();
        assert_eq!(manifest.len(), 5);
        assert_eq!(manifest.dependencies[0].name, "cloudpickle");
        assert_eq!(
            manifest.dependencies[0].constraint.as_deref(),
            Some("==0.4.0")
        );
        assert_eq!(manifest.dependencies[2].constraint.as_deref(), Some(">=1.19"));
        assert!(manifest.dependencies[3].constraint.is_none());
        assert_eq!(
            manifest.dependencies[4].constraint.as_deref(),
            Some("; sys_platform == \"linux\"")
        );
        assert_eq!(
            manifest.options,
            vec!["--extra-index-url https://example.org/simple"]
        );
    }

    #[test]
    fn test_extras_are_part_of_constraint() {
        let manifest = DependencyManifest::parse("requests[security]>=2.0\n").unwrap();
        assert_eq!(manifest.dependencies[0].name, "requests");
        assert_eq!(
            manifest.dependencies[0].to_string(),
            "requests[security]>=2.0"
        );
    }

    #[test]
    fn test_lookup_is_normalized() {
        let manifest = DependencyManifest::parse("PyYAML==5.4\nfpdf2\n").unwrap();
        assert!(manifest.get("pyyaml").is_some());
        assert!(manifest.get("FPDF2").is_some());
        assert!(manifest.get("missing").is_none());
    }

    #[test]
    fn test_invalid_name() {
        let err = DependencyManifest::parse("numpy\n@@bad\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_invalid_constraint() {
        assert!(DependencyManifest::parse("numpy 1.2\n").is_err());
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = DependencyManifest::parse("\n# nothing\n").unwrap();
        assert!(manifest.is_empty());
    }
}
