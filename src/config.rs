//! Repository configuration (`<gitdir>/config`).
//!
//! INI-style sections with optional quoted subsections. Parsing keeps every
//! entry in order (later entries win on lookup, matching last-wins
//! semantics); serialization writes the same shape back. The typed
//! [`ConfigSnapshot`] covers the keys the core actually consults.

use keel_odb::HashKind;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Raw config model
// ---------------------------------------------------------------------------

/// One `[section]` or `[section "subsection"]` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    /// Section name, lowercased.
    pub name: String,
    /// Subsection, verbatim (case-sensitive).
    pub subsection: Option<String>,
    /// Key/value pairs in file order; keys lowercased.
    pub entries: Vec<(String, String)>,
}

/// A parsed config file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    sections: Vec<Section>,
}

impl Config {
    /// Parse config text.
    ///
    /// # Errors
    /// [`Error::Corrupt`] on an unterminated section header.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut sections: Vec<Section> = Vec::new();
        for raw_line in text.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let header = header.strip_suffix(']').ok_or_else(|| Error::Corrupt {
                    at: "config".to_owned(),
                    detail: format!("unterminated section header {raw_line:?}"),
                })?;
                let (name, subsection) = match header.split_once(' ') {
                    Some((name, sub)) => {
                        let sub = sub.trim().trim_matches('"').to_owned();
                        (name.to_ascii_lowercase(), Some(sub))
                    }
                    None => (header.to_ascii_lowercase(), None),
                };
                sections.push(Section { name, subsection, entries: Vec::new() });
            } else if let Some(section) = sections.last_mut() {
                let (key, value) = match line.split_once('=') {
                    Some((k, v)) => (k.trim().to_ascii_lowercase(), unquote(v.trim())),
                    // A bare key means boolean true.
                    None => (line.to_ascii_lowercase(), "true".to_owned()),
                };
                section.entries.push((key, value));
            }
            // Entries before any section header are ignored, as git does.
        }
        Ok(Self { sections })
    }

    /// Serialize back to config text.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            match &section.subsection {
                Some(sub) => {
                    out.push_str(&format!("[{} \"{}\"]\n", section.name, sub));
                }
                None => out.push_str(&format!("[{}]\n", section.name)),
            }
            for (key, value) in &section.entries {
                out.push_str(&format!("\t{key} = {value}\n"));
            }
        }
        out
    }

    /// Look up `section.key` or `section.subsection.key`. Last entry wins.
    #[must_use]
    pub fn get(&self, dotted: &str) -> Option<&str> {
        let (name, subsection, key) = split_dotted(dotted)?;
        self.sections
            .iter()
            .filter(|s| s.name == name && s.subsection.as_deref() == subsection)
            .flat_map(|s| s.entries.iter())
            .filter(|(k, _)| *k == key)
            .next_back()
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `section.key` across matching sections, in order.
    #[must_use]
    pub fn get_all(&self, dotted: &str) -> Vec<&str> {
        let Some((name, subsection, key)) = split_dotted(dotted) else {
            return Vec::new();
        };
        self.sections
            .iter()
            .filter(|s| s.name == name && s.subsection.as_deref() == subsection)
            .flat_map(|s| s.entries.iter())
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Set `section[.subsection].key`, replacing an existing entry or
    /// appending a new section as needed.
    pub fn set(&mut self, dotted: &str, value: &str) {
        let Some((name, subsection, key)) = split_dotted(dotted) else {
            return;
        };
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.name == name && s.subsection.as_deref() == subsection);
        let section = match section {
            Some(s) => s,
            None => {
                self.sections.push(Section {
                    name: name.to_owned(),
                    subsection: subsection.map(str::to_owned),
                    entries: Vec::new(),
                });
                self.sections.last_mut().expect("just pushed")
            }
        };
        if let Some(entry) = section.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value.to_owned();
        } else {
            section.entries.push((key.to_owned(), value.to_owned()));
        }
    }

    /// Subsection names of every `[section "..."]` block (e.g. remote
    /// names).
    #[must_use]
    pub fn subsections(&self, name: &str) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| s.name == name)
            .filter_map(|s| s.subsection.as_deref())
            .collect()
    }

    /// `true`/`false`/`yes`/`no`/`on`/`off`/`1`/`0` interpretation.
    #[must_use]
    pub fn get_bool(&self, dotted: &str) -> Option<bool> {
        match self.get(dotted)?.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" | "" => Some(false),
            _ => None,
        }
    }
}

fn strip_comment(line: &str) -> &str {
    // Quote-aware enough for config values the core writes itself.
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '#' | ';' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> String {
    value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value).to_owned()
}

fn split_dotted(dotted: &str) -> Option<(&str, Option<&str>, &str)> {
    let (name, rest) = dotted.split_once('.')?;
    match rest.rsplit_once('.') {
        Some((subsection, key)) => Some((name, Some(subsection), key)),
        None => Some((name, None, rest)),
    }
}

// ---------------------------------------------------------------------------
// Typed snapshot
// ---------------------------------------------------------------------------

/// A remote's configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Remote name (`origin`).
    pub name: String,
    /// Fetch/push URL.
    pub url: Option<String>,
    /// Fetch refspecs in order.
    pub fetch: Vec<String>,
}

/// The config keys the core consults, resolved once at open time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// `core.repositoryformatversion` (0 or 1).
    pub repository_format_version: u32,
    /// `core.bare`.
    pub bare: bool,
    /// `extensions.objectformat`; absent means SHA-1.
    pub object_format: HashKind,
    /// `init.defaultbranch`; absent means `main`.
    pub default_branch: String,
    /// All `[remote "..."]` sections.
    pub remotes: Vec<RemoteConfig>,
}

impl ConfigSnapshot {
    /// Resolve the snapshot from a parsed config.
    ///
    /// # Errors
    /// [`Error::Unsupported`] for an unknown `extensions.objectformat`, or
    /// a repository format version above 1.
    pub fn resolve(config: &Config) -> Result<Self, Error> {
        let repository_format_version = config
            .get("core.repositoryformatversion")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if repository_format_version > 1 {
            return Err(Error::Unsupported {
                what: format!("repository format version {repository_format_version}"),
            });
        }

        let object_format = match config.get("extensions.objectformat") {
            None => HashKind::Sha1,
            Some(name) => HashKind::from_config_name(name).ok_or_else(|| Error::Unsupported {
                what: format!("object format {name}"),
            })?,
        };

        let remotes = config
            .subsections("remote")
            .into_iter()
            .map(|name| RemoteConfig {
                name: name.to_owned(),
                url: config.get(&format!("remote.{name}.url")).map(str::to_owned),
                fetch: config
                    .get_all(&format!("remote.{name}.fetch"))
                    .into_iter()
                    .map(str::to_owned)
                    .collect(),
            })
            .collect();

        Ok(Self {
            repository_format_version,
            bare: config.get_bool("core.bare").unwrap_or(false),
            object_format,
            default_branch: config
                .get("init.defaultbranch")
                .unwrap_or("main")
                .to_owned(),
            remotes,
        })
    }

    /// Look up a remote by name.
    #[must_use]
    pub fn remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[core]
\trepositoryformatversion = 0
\tbare = false
[extensions]
\tobjectformat = sha256
[remote \"origin\"]
\turl = https://example.com/repo.git
\tfetch = +refs/heads/*:refs/remotes/origin/*
[branch \"main\"]
\tremote = origin
\tmerge = refs/heads/main
[init]
\tdefaultBranch = trunk
";

    #[test]
    fn parse_and_lookup() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.get("core.repositoryformatversion"), Some("0"));
        assert_eq!(config.get("remote.origin.url"), Some("https://example.com/repo.git"));
        assert_eq!(config.get("branch.main.merge"), Some("refs/heads/main"));
        // Keys are case-insensitive.
        assert_eq!(config.get("init.defaultbranch"), Some("trunk"));
        assert_eq!(config.get_bool("core.bare"), Some(false));
    }

    #[test]
    fn roundtrip_preserves_entries() {
        let config = Config::parse(SAMPLE).unwrap();
        let reparsed = Config::parse(&config.serialize()).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn snapshot_resolves_typed_values() {
        let config = Config::parse(SAMPLE).unwrap();
        let snap = ConfigSnapshot::resolve(&config).unwrap();
        assert_eq!(snap.object_format, HashKind::Sha256);
        assert!(!snap.bare);
        assert_eq!(snap.default_branch, "trunk");
        let origin = snap.remote("origin").expect("origin");
        assert_eq!(origin.fetch, vec!["+refs/heads/*:refs/remotes/origin/*"]);
    }

    #[test]
    fn missing_object_format_defaults_to_sha1() {
        let config = Config::parse("[core]\n\tbare = true\n").unwrap();
        let snap = ConfigSnapshot::resolve(&config).unwrap();
        assert_eq!(snap.object_format, HashKind::Sha1);
        assert!(snap.bare);
    }

    #[test]
    fn set_replaces_or_appends() {
        let mut config = Config::parse("[core]\n\tbare = false\n").unwrap();
        config.set("core.bare", "true");
        config.set("remote.origin.url", "ssh://host/repo");
        assert_eq!(config.get("core.bare"), Some("true"));
        assert_eq!(config.get("remote.origin.url"), Some("ssh://host/repo"));
    }

    #[test]
    fn comments_are_ignored() {
        let config = Config::parse("[core] # tail\n\t; full line\n\tbare = true # why\n").unwrap();
        assert_eq!(config.get_bool("core.bare"), Some(true));
    }

    #[test]
    fn unterminated_header_is_corrupt() {
        assert!(Config::parse("[core\nbare = true\n").is_err());
    }

    #[test]
    fn future_format_version_is_unsupported() {
        let config = Config::parse("[core]\n\trepositoryformatversion = 2\n").unwrap();
        assert!(matches!(
            ConfigSnapshot::resolve(&config),
            Err(Error::Unsupported { .. })
        ));
    }
}
