//! Parsed configuration directives, shared by the `depmod.conf`/`depmod.d`
//! and `modprobe.conf`/`modprobe.d` grammars. Both tools read the same
//! directive set; each only acts on the subset relevant to it.

/// One parsed, logical-line directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRecord {
    /// `alias <wildcard> <realname>`
    Alias { pattern: String, target: String },
    /// `options <modulename> <option>...`
    Options { module: String, options: Vec<String> },
    /// `install <modulename> <command>`
    Install { module: String, command: String },
    /// `remove <modulename> <command>`
    Remove { module: String, command: String },
    /// `blacklist <modulename>`
    Blacklist { module: String },
    /// `softdep <modulename> pre: <mod>... post: <mod>...`
    Softdep {
        module: String,
        pre: Vec<String>,
        post: Vec<String>,
    },
    /// `search <dir>...` (depmod.conf only: extra search subdirectories,
    /// in priority order).
    Search { dirs: Vec<String> },
    /// `override <modulename> <kernel-version> <path>`
    Override {
        module: String,
        kernel_version: String,
        path: String,
    },
    /// `config <key> <value>` — opaque passthrough for directives neither
    /// tool interprets structurally but that must still survive a reparse.
    Config { key: String, value: String },
    /// `make_map_files <yes|no>`
    MakeMapFiles(bool),
    /// `include <path>` — expanded by the parser itself, not surfaced to
    /// callers as a record; kept here only so [`super::parser::parse_line`]
    /// has somewhere to put it before expansion.
    Include { path: String },
}
