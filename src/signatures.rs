use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid regex pattern `{pattern}` in signature `{signature}`: {source}")]
    InvalidPattern {
        signature: String,
        pattern: String,
        source: regex::Error,
    },

    #[error("signature `{0}` has no detection patterns")]
    EmptySignature(String),
}

/// One agent signature as configured.
///
/// Pattern lists are ordered; a process name check runs before command-line
/// patterns, which run before executable-path patterns. Signatures are
/// immutable once loaded; a reload replaces the whole set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub display_name: String,
    /// Exact process names, compared case-insensitively.
    #[serde(default)]
    pub process_name_patterns: Vec<String>,
    /// Regex patterns applied to the full command line.
    #[serde(default)]
    pub cmdline_patterns: Vec<String>,
    /// Regex patterns applied to the executable path.
    #[serde(default)]
    pub exe_path_patterns: Vec<String>,
    /// Parent process names that commonly spawn this agent.
    #[serde(default)]
    pub parent_hints: Vec<String>,
    /// Remote endpoints this agent is expected to talk to.
    #[serde(default)]
    pub network_endpoint_hints: Vec<String>,
    /// Whether descendants inherit this agent's attribution.
    #[serde(default)]
    pub track_children: bool,
}

/// A signature with its regexes compiled for matching.
#[derive(Debug)]
pub struct CompiledSignature {
    pub signature: Signature,
    cmdline_regexes: Vec<Regex>,
    exe_regexes: Vec<Regex>,
}

impl CompiledSignature {
    fn compile(signature: Signature) -> Result<Self, SignatureError> {
        if signature.process_name_patterns.is_empty()
            && signature.cmdline_patterns.is_empty()
            && signature.exe_path_patterns.is_empty()
        {
            return Err(SignatureError::EmptySignature(signature.name.clone()));
        }

        let compile_list = |patterns: &[String]| -> Result<Vec<Regex>, SignatureError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| SignatureError::InvalidPattern {
                        signature: signature.name.clone(),
                        pattern: p.clone(),
                        source,
                    })
                })
                .collect()
        };

        let cmdline_regexes = compile_list(&signature.cmdline_patterns)?;
        let exe_regexes = compile_list(&signature.exe_path_patterns)?;

        Ok(Self {
            signature,
            cmdline_regexes,
            exe_regexes,
        })
    }

    /// First matching predicate wins: name, then cmdline, then exe path.
    fn matches(&self, name: &str, cmdline: &str, exe_path: Option<&str>) -> bool {
        if self
            .signature
            .process_name_patterns
            .iter()
            .any(|p| name.eq_ignore_ascii_case(p))
        {
            return true;
        }

        if self.cmdline_regexes.iter().any(|re| re.is_match(cmdline)) {
            return true;
        }

        if let Some(exe) = exe_path {
            if self.exe_regexes.iter().any(|re| re.is_match(exe)) {
                return true;
            }
        }

        false
    }
}

/// Immutable compiled signature set. Order is configuration order; the
/// first signature with any matching predicate wins.
#[derive(Debug, Default)]
pub struct SignatureSet {
    signatures: Vec<CompiledSignature>,
}

impl SignatureSet {
    /// Compile a list of raw signatures, skipping invalid entries with a
    /// warning rather than failing the whole load.
    pub fn compile(raw: Vec<Signature>) -> Self {
        let mut signatures = Vec::with_capacity(raw.len());
        for sig in raw {
            let name = sig.name.clone();
            match CompiledSignature::compile(sig) {
                Ok(compiled) => signatures.push(compiled),
                Err(e) => warn!("Skipping signature `{}`: {}", name, e),
            }
        }
        Self { signatures }
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.iter().map(|s| &s.signature)
    }

    pub fn get(&self, name: &str) -> Option<&Signature> {
        self.signatures
            .iter()
            .find(|s| s.signature.name == name)
            .map(|s| &s.signature)
    }

    fn match_direct(&self, name: &str, cmdline: &str, exe_path: Option<&str>) -> Option<&Signature> {
        self.signatures
            .iter()
            .find(|s| s.matches(name, cmdline, exe_path))
            .map(|s| &s.signature)
    }
}

/// How a process acquired its agent attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub agent: String,
    /// True for a direct signature match, false for inheritance from the
    /// parent.
    pub direct: bool,
}

/// Classifies processes against an atomically swapped signature set.
///
/// Matching works on an `Arc` snapshot, so concurrent matches never block a
/// reload; matches in flight when a reload lands keep using the old set.
pub struct SignatureMatcher {
    current: RwLock<Arc<SignatureSet>>,
}

impl SignatureMatcher {
    pub fn new(set: SignatureSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SignatureSet::compile(default_signatures()))
    }

    /// Current set snapshot.
    pub fn snapshot(&self) -> Arc<SignatureSet> {
        self.current.read().expect("signature lock poisoned").clone()
    }

    /// Publish a new signature set; subsequent matches use it.
    pub fn swap(&self, set: SignatureSet) {
        let count = set.len();
        *self.current.write().expect("signature lock poisoned") = Arc::new(set);
        info!("Signature set reloaded ({} signatures)", count);
    }

    /// Resolve a process's attribution.
    ///
    /// A direct match always takes precedence over inheritance. Without a
    /// direct match the process inherits the parent's agent when that
    /// agent's signature tracks children.
    pub fn resolve(
        &self,
        name: &str,
        cmdline: &str,
        exe_path: Option<&str>,
        parent_agent: Option<&str>,
    ) -> Option<Attribution> {
        let set = self.snapshot();

        if let Some(sig) = set.match_direct(name, cmdline, exe_path) {
            return Some(Attribution {
                agent: sig.name.clone(),
                direct: true,
            });
        }

        if let Some(parent) = parent_agent {
            if set.get(parent).map(|s| s.track_children).unwrap_or(false) {
                return Some(Attribution {
                    agent: parent.to_string(),
                    direct: false,
                });
            }
        }

        None
    }
}

/// Load raw signatures from a YAML file.
pub fn load_signature_file(path: &Path) -> Result<Vec<Signature>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read signature file {:?}", path))?;
    let signatures: Vec<Signature> = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse signature file {:?}", path))?;
    Ok(signatures)
}

/// Built-in signatures used when no signature file is configured.
pub fn default_signatures() -> Vec<Signature> {
    vec![
        Signature {
            name: "claude-code".to_string(),
            display_name: "Claude Code".to_string(),
            process_name_patterns: vec!["claude".to_string()],
            cmdline_patterns: vec![r"claude(\s+(chat|code|--|api)|\s+-p)".to_string()],
            exe_path_patterns: vec![],
            parent_hints: vec![
                "bash".to_string(),
                "zsh".to_string(),
                "fish".to_string(),
                "pwsh".to_string(),
            ],
            network_endpoint_hints: vec![
                "api.anthropic.com".to_string(),
                "statsig.anthropic.com".to_string(),
            ],
            track_children: true,
        },
        Signature {
            name: "cursor".to_string(),
            display_name: "Cursor".to_string(),
            process_name_patterns: vec![
                "Cursor".to_string(),
                "cursor".to_string(),
                "Cursor Helper".to_string(),
            ],
            cmdline_patterns: vec![],
            exe_path_patterns: vec![r"Cursor.*\.app".to_string(), r"cursor\.exe".to_string()],
            parent_hints: vec![],
            network_endpoint_hints: vec![
                "api.cursor.sh".to_string(),
                "api.openai.com".to_string(),
            ],
            track_children: true,
        },
        Signature {
            name: "aider".to_string(),
            display_name: "Aider".to_string(),
            process_name_patterns: vec!["aider".to_string()],
            cmdline_patterns: vec![r"aider\s+".to_string()],
            exe_path_patterns: vec![],
            parent_hints: vec![
                "bash".to_string(),
                "zsh".to_string(),
                "python".to_string(),
                "python3".to_string(),
            ],
            network_endpoint_hints: vec![
                "api.openai.com".to_string(),
                "api.anthropic.com".to_string(),
            ],
            track_children: true,
        },
        Signature {
            name: "windsurf".to_string(),
            display_name: "Windsurf".to_string(),
            process_name_patterns: vec!["Windsurf".to_string(), "windsurf".to_string()],
            cmdline_patterns: vec![],
            exe_path_patterns: vec![r"[Ww]indsurf".to_string()],
            parent_hints: vec![],
            network_endpoint_hints: vec![],
            track_children: true,
        },
        Signature {
            name: "continue-dev".to_string(),
            display_name: "Continue.dev".to_string(),
            process_name_patterns: vec!["continue".to_string()],
            cmdline_patterns: vec![r"continue\.dev".to_string()],
            exe_path_patterns: vec![],
            parent_hints: vec![],
            network_endpoint_hints: vec![],
            track_children: true,
        },
        Signature {
            name: "copilot".to_string(),
            display_name: "GitHub Copilot".to_string(),
            process_name_patterns: vec![],
            cmdline_patterns: vec![r"copilot".to_string(), r"github\.copilot".to_string()],
            exe_path_patterns: vec![],
            parent_hints: vec!["code".to_string(), "Code".to_string()],
            network_endpoint_hints: vec![
                "api.github.com".to_string(),
                "copilot-proxy.githubusercontent.com".to_string(),
            ],
            track_children: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> SignatureMatcher {
        SignatureMatcher::with_defaults()
    }

    #[test]
    fn matches_by_process_name() {
        let m = matcher();
        let attr = m.resolve("claude", "claude", None, None).unwrap();
        assert_eq!(attr.agent, "claude-code");
        assert!(attr.direct);
    }

    #[test]
    fn matches_by_cmdline() {
        let m = matcher();
        let attr = m
            .resolve("node", "claude chat --verbose", None, None)
            .unwrap();
        assert_eq!(attr.agent, "claude-code");
    }

    #[test]
    fn matches_by_exe_path() {
        let m = matcher();
        let attr = m
            .resolve(
                "Electron",
                "electron",
                Some("/Applications/Cursor.app/Contents/MacOS/Cursor"),
                None,
            )
            .unwrap();
        assert_eq!(attr.agent, "cursor");
    }

    #[test]
    fn first_signature_wins() {
        let raw = vec![
            Signature {
                name: "first".to_string(),
                display_name: "First".to_string(),
                process_name_patterns: vec!["tool".to_string()],
                cmdline_patterns: vec![],
                exe_path_patterns: vec![],
                parent_hints: vec![],
                network_endpoint_hints: vec![],
                track_children: false,
            },
            Signature {
                name: "second".to_string(),
                display_name: "Second".to_string(),
                process_name_patterns: vec!["tool".to_string()],
                cmdline_patterns: vec![],
                exe_path_patterns: vec![],
                parent_hints: vec![],
                network_endpoint_hints: vec![],
                track_children: false,
            },
        ];
        let m = SignatureMatcher::new(SignatureSet::compile(raw));
        let attr = m.resolve("tool", "tool", None, None).unwrap();
        assert_eq!(attr.agent, "first");
    }

    #[test]
    fn child_inherits_when_tracking_enabled() {
        let m = matcher();
        let attr = m
            .resolve("node", "node build.js", None, Some("claude-code"))
            .unwrap();
        assert_eq!(attr.agent, "claude-code");
        assert!(!attr.direct);
    }

    #[test]
    fn direct_match_beats_inheritance() {
        let m = matcher();
        // Child matches aider directly even though the parent is claude-code
        // with child tracking on.
        let attr = m
            .resolve("aider", "aider --model gpt-4", None, Some("claude-code"))
            .unwrap();
        assert_eq!(attr.agent, "aider");
        assert!(attr.direct);
    }

    #[test]
    fn no_inheritance_without_track_children() {
        let raw = vec![Signature {
            name: "one-shot".to_string(),
            display_name: "One Shot".to_string(),
            process_name_patterns: vec!["oneshot".to_string()],
            cmdline_patterns: vec![],
            exe_path_patterns: vec![],
            parent_hints: vec![],
            network_endpoint_hints: vec![],
            track_children: false,
        }];
        let m = SignatureMatcher::new(SignatureSet::compile(raw));
        assert!(m.resolve("sh", "sh -c ls", None, Some("one-shot")).is_none());
    }

    #[test]
    fn invalid_pattern_is_skipped_not_fatal() {
        let raw = vec![
            Signature {
                name: "broken".to_string(),
                display_name: "Broken".to_string(),
                process_name_patterns: vec![],
                cmdline_patterns: vec!["(unclosed".to_string()],
                exe_path_patterns: vec![],
                parent_hints: vec![],
                network_endpoint_hints: vec![],
                track_children: false,
            },
            Signature {
                name: "valid".to_string(),
                display_name: "Valid".to_string(),
                process_name_patterns: vec!["valid".to_string()],
                cmdline_patterns: vec![],
                exe_path_patterns: vec![],
                parent_hints: vec![],
                network_endpoint_hints: vec![],
                track_children: false,
            },
        ];
        let set = SignatureSet::compile(raw);
        assert_eq!(set.len(), 1);
        assert!(set.get("valid").is_some());
        assert!(set.get("broken").is_none());
    }

    #[test]
    fn swap_replaces_whole_set() {
        let m = matcher();
        assert!(m.resolve("claude", "claude", None, None).is_some());

        m.swap(SignatureSet::compile(vec![]));
        assert!(m.resolve("claude", "claude", None, None).is_none());
    }
}
