//! Parses the directive grammar shared by `depmod.conf`/`depmod.d` and
//! `modprobe.conf`/`modprobe.d` into [`ConfigRecord`]s, and folds a
//! directory's worth of them into one [`ConfigSet`].

use std::path::Path;

use super::error::ConfigError;
use super::record::ConfigRecord;
use super::scan::scan_conf_dir;
use crate::util::fold_lines;

/// Accumulated directives from one or more configuration files, in
/// application order.
#[derive(Debug, Default, Clone)]
pub struct ConfigSet {
    pub aliases: Vec<(String, String)>,
    pub options: Vec<(String, Vec<String>)>,
    pub installs: Vec<(String, String)>,
    pub removes: Vec<(String, String)>,
    pub blacklist: Vec<String>,
    pub softdeps: Vec<(String, Vec<String>, Vec<String>)>,
    pub search_dirs: Vec<String>,
    pub overrides: Vec<(String, String, String)>,
    pub configs: Vec<(String, String)>,
    pub make_map_files: bool,
}

impl ConfigSet {
    /// Apply one record, in the order records were encountered.
    ///
    /// `alias` does not deduplicate: a later file's alias for the same
    /// pattern simply adds another candidate, and priority at lookup time
    /// (not parse time) decides which wins.
    fn push(&mut self, record: ConfigRecord) {
        match record {
            ConfigRecord::Alias { pattern, target } => self.aliases.push((pattern, target)),
            ConfigRecord::Options { module, options } => self.options.push((module, options)),
            ConfigRecord::Install { module, command } => self.installs.push((module, command)),
            ConfigRecord::Remove { module, command } => self.removes.push((module, command)),
            ConfigRecord::Blacklist { module } => self.blacklist.push(module),
            ConfigRecord::Softdep { module, pre, post } => self.softdeps.push((module, pre, post)),
            ConfigRecord::Search { dirs } => self.search_dirs.extend(dirs),
            ConfigRecord::Override { module, kernel_version, path } => {
                self.overrides.push((module, kernel_version, path))
            }
            ConfigRecord::Config { key, value } => self.configs.push((key, value)),
            ConfigRecord::MakeMapFiles(v) => self.make_map_files = v,
            ConfigRecord::Include { .. } => {
                unreachable!("include is expanded by parse_records, never pushed directly")
            }
        }
    }

    /// Fold another `ConfigSet` into this one. Every field accumulates
    /// except `aliases`, which is *replaced* wholesale — this reproduces
    /// an intentionally preserved quirk of `include` processing (see
    /// [`parse_file`]).
    fn merge_replacing_aliases(&mut self, other: ConfigSet) {
        self.aliases = other.aliases;
        self.options.extend(other.options);
        self.installs.extend(other.installs);
        self.removes.extend(other.removes);
        self.blacklist.extend(other.blacklist);
        self.softdeps.extend(other.softdeps);
        self.search_dirs.extend(other.search_dirs);
        self.overrides.extend(other.overrides);
        self.configs.extend(other.configs);
        self.make_map_files = other.make_map_files;
    }

    fn merge_accumulating(&mut self, other: ConfigSet) {
        self.aliases.extend(other.aliases);
        self.options.extend(other.options);
        self.installs.extend(other.installs);
        self.removes.extend(other.removes);
        self.blacklist.extend(other.blacklist);
        self.softdeps.extend(other.softdeps);
        self.search_dirs.extend(other.search_dirs);
        self.overrides.extend(other.overrides);
        self.configs.extend(other.configs);
        self.make_map_files = other.make_map_files;
    }
}

/// Parse one logical (already line-folded) line into a record.
///
/// Returns `Ok(None)` for blank lines and `#`-comments.
fn parse_line(line: &str, line_no: usize) -> Result<Option<ConfigRecord>, ConfigError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let keyword = words.next().unwrap();
    let rest: Vec<&str> = words.collect();

    let record = match keyword {
        "alias" => {
            let [pattern, target] = require_n(&rest, line_no, "alias")?;
            ConfigRecord::Alias {
                pattern: pattern.to_owned(),
                target: target.to_owned(),
            }
        }
        "options" => {
            if rest.len() < 2 {
                return Err(ConfigError::Malformed(line_no, "options needs a module and at least one option".into()));
            }
            ConfigRecord::Options {
                module: rest[0].to_owned(),
                options: rest[1..].iter().map(|s| (*s).to_owned()).collect(),
            }
        }
        "install" => {
            if rest.len() < 2 {
                return Err(ConfigError::Malformed(line_no, "install needs a module and a command".into()));
            }
            ConfigRecord::Install {
                module: rest[0].to_owned(),
                command: rest[1..].join(" "),
            }
        }
        "remove" => {
            if rest.is_empty() {
                return Err(ConfigError::Malformed(line_no, "remove needs a module".into()));
            }
            ConfigRecord::Remove {
                module: rest[0].to_owned(),
                command: rest[1..].join(" "),
            }
        }
        "blacklist" => {
            let [module] = require_n(&rest, line_no, "blacklist")?;
            ConfigRecord::Blacklist { module: module.to_owned() }
        }
        "softdep" => parse_softdep(&rest, line_no)?,
        "search" => {
            if rest.is_empty() {
                return Err(ConfigError::Malformed(line_no, "search needs at least one directory".into()));
            }
            ConfigRecord::Search {
                dirs: rest.iter().map(|s| (*s).to_owned()).collect(),
            }
        }
        "override" => {
            if rest.len() != 3 {
                return Err(ConfigError::Malformed(line_no, "override needs module, kernel version, path".into()));
            }
            ConfigRecord::Override {
                module: rest[0].to_owned(),
                kernel_version: rest[1].to_owned(),
                path: rest[2].to_owned(),
            }
        }
        "config" => {
            if rest.len() < 2 {
                return Err(ConfigError::Malformed(line_no, "config needs a key and a value".into()));
            }
            ConfigRecord::Config {
                key: rest[0].to_owned(),
                value: rest[1..].join(" "),
            }
        }
        "make_map_files" => {
            let [value] = require_n(&rest, line_no, "make_map_files")?;
            let enabled = match value {
                "yes" | "true" | "1" => true,
                "no" | "false" | "0" => false,
                other => return Err(ConfigError::Malformed(line_no, format!("invalid make_map_files value '{other}'"))),
            };
            ConfigRecord::MakeMapFiles(enabled)
        }
        "include" => {
            let [path] = require_n(&rest, line_no, "include")?;
            ConfigRecord::Include { path: path.to_owned() }
        }
        other => return Err(ConfigError::UnknownDirective(line_no, other.to_owned())),
    };
    Ok(Some(record))
}

fn require_n<'a, const N: usize>(rest: &[&'a str], line_no: usize, keyword: &str) -> Result<[&'a str; N], ConfigError> {
    rest.try_into()
        .map_err(|_| ConfigError::Malformed(line_no, format!("{keyword} takes exactly {N} argument(s)")))
}

/// `softdep <module> [pre: <mod>...] [post: <mod>...]`
fn parse_softdep(rest: &[&str], line_no: usize) -> Result<ConfigRecord, ConfigError> {
    let Some((&module, tail)) = rest.split_first() else {
        return Err(ConfigError::Malformed(line_no, "softdep needs a module name".into()));
    };
    let mut pre = Vec::new();
    let mut post = Vec::new();
    let mut target: Option<&mut Vec<String>> = None;
    for &tok in tail {
        match tok {
            "pre:" => target = Some(&mut pre),
            "post:" => target = Some(&mut post),
            _ => match target.as_deref_mut() {
                Some(v) => v.push(tok.to_owned()),
                None => return Err(ConfigError::Malformed(line_no, "softdep module names must follow 'pre:' or 'post:'".into())),
            },
        }
    }
    Ok(ConfigRecord::Softdep {
        module: module.to_owned(),
        pre,
        post,
    })
}

/// Parse the full text of one configuration file.
///
/// `include` directives are expanded recursively, relative to `base_dir`.
/// Per `include`'s asymmetric semantics: the included file's aliases
/// *replace* whatever aliases were accumulated before the `include` line,
/// while every other directive type simply accumulates. This mirrors a
/// real historical quirk of the reference implementation and is kept
/// deliberately rather than "fixed".
pub fn parse_file(text: &str, base_dir: &Path) -> Result<ConfigSet, ConfigError> {
    let mut set = ConfigSet::default();
    for (line_no, logical_line) in fold_lines(text).into_iter().enumerate() {
        let Some(record) = parse_line(&logical_line, line_no + 1)? else {
            continue;
        };
        if let ConfigRecord::Include { path } = record {
            let included_path = base_dir.join(&path);
            let included_text = std::fs::read_to_string(&included_path)
                .map_err(|e| ConfigError::Io(included_path.display().to_string(), e.to_string()))?;
            let included_base = included_path.parent().unwrap_or(base_dir);
            let included = parse_file(&included_text, included_base)?;
            set.merge_replacing_aliases(included);
        } else {
            set.push(record);
        }
    }
    Ok(set)
}

/// Parse every file [`scan_conf_dir`] keeps in `dir`, in basename order,
/// folding them into one [`ConfigSet`]. Directives accumulate normally
/// across files in a scanned directory; only an explicit `include`
/// directive replaces aliases.
pub fn parse_scan(dir: &Path) -> Result<ConfigSet, ConfigError> {
    let mut set = ConfigSet::default();
    for path in scan_conf_dir(dir).map_err(|e| ConfigError::Io(dir.display().to_string(), e.to_string()))? {
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        let parsed = parse_file(&text, dir)?;
        set.merge_accumulating(parsed);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_alias_and_blacklist() {
        let set = parse_file("alias eth* e1000e\nblacklist nouveau\n", Path::new(".")).unwrap();
        assert_eq!(set.aliases, vec![("eth*".to_owned(), "e1000e".to_owned())]);
        assert_eq!(set.blacklist, vec!["nouveau".to_owned()]);
    }

    #[test]
    fn parses_softdep_pre_and_post() {
        let set = parse_file("softdep snd-hda-intel pre: snd-hda-codec post: snd-seq\n", Path::new(".")).unwrap();
        assert_eq!(
            set.softdeps,
            vec![(
                "snd-hda-intel".to_owned(),
                vec!["snd-hda-codec".to_owned()],
                vec!["snd-seq".to_owned()],
            )]
        );
    }

    #[test]
    fn rejects_unknown_directive() {
        let err = parse_file("frobnicate foo\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDirective(1, _)));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let set = parse_file("# a comment\n\nalias foo bar\n", Path::new(".")).unwrap();
        assert_eq!(set.aliases.len(), 1);
    }

    #[test]
    fn include_replaces_aliases_but_accumulates_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("included.conf"), "alias included_alias real\nblacklist from_included\n").unwrap();
        let main = "alias main_alias real\nblacklist from_main\ninclude included.conf\n";
        let set = parse_file(main, dir.path()).unwrap();
        assert_eq!(set.aliases, vec![("included_alias".to_owned(), "real".to_owned())]);
        assert_eq!(set.blacklist, vec!["from_main".to_owned(), "from_included".to_owned()]);
    }

    #[test]
    fn fold_lines_then_parse_handles_continuation() {
        let set = parse_file("options foo \\\nbar=1 baz=2\n", Path::new(".")).unwrap();
        assert_eq!(
            set.options,
            vec![("foo".to_owned(), vec!["bar=1".to_owned(), "baz=2".to_owned()])]
        );
    }
}
