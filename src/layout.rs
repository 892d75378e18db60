//! Repository layout: mapping typed file handles to paths.
//!
//! The worker on the far side of the bus sees plain directory and file
//! names; this module decides where each kind of repository file lives.
//! Pack files fan out into 256 prefix directories to keep listings flat.

/// Kinds of files a repository holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Pack,
    Key,
    Lock,
    Snapshot,
    Index,
    Config,
}

impl FileType {
    /// Every type that lives under its own directory (everything but the
    /// config file).
    pub const DIRS: [FileType; 5] = [
        FileType::Pack,
        FileType::Key,
        FileType::Lock,
        FileType::Snapshot,
        FileType::Index,
    ];
}

/// Reference to a single repository file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    /// Handle of the repository config file.
    pub fn config() -> Self {
        Self::new(FileType::Config, "")
    }
}

/// POSIX-style join, skipping empty components.
pub fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        let part = part.trim_matches('/');
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// The default repository layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLayout;

impl DefaultLayout {
    /// Directory a handle's file lives in, relative to the repository
    /// root. Empty for the config file.
    pub fn dirname(&self, h: &Handle) -> String {
        match h.file_type {
            FileType::Config => String::new(),
            FileType::Pack if h.name.len() >= 2 => format!("data/{}", &h.name[..2]),
            FileType::Pack => "data".to_string(),
            FileType::Key => "keys".to_string(),
            FileType::Lock => "locks".to_string(),
            FileType::Snapshot => "snapshots".to_string(),
            FileType::Index => "index".to_string(),
        }
    }

    /// File name without its directory.
    pub fn basename(&self, h: &Handle) -> String {
        match h.file_type {
            FileType::Config => "config".to_string(),
            _ => h.name.clone(),
        }
    }

    /// Full path of a handle's file relative to the repository root.
    pub fn filename(&self, h: &Handle) -> String {
        join(&[&self.dirname(h), &self.basename(h)])
    }

    /// Directory to list for a file type and whether listing must recurse.
    pub fn basedir(&self, t: FileType) -> (String, bool) {
        match t {
            FileType::Pack => ("data".to_string(), true),
            FileType::Key => ("keys".to_string(), false),
            FileType::Lock => ("locks".to_string(), false),
            FileType::Snapshot => ("snapshots".to_string(), false),
            FileType::Index => ("index".to_string(), false),
            FileType::Config => (String::new(), false),
        }
    }

    /// Every directory a fresh repository needs.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = vec![
            "data".to_string(),
            "index".to_string(),
            "keys".to_string(),
            "locks".to_string(),
            "snapshots".to_string(),
        ];
        paths.extend((0..=0xffu32).map(|i| format!("data/{i:02x}")));
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_files_fan_out_by_prefix() {
        let layout = DefaultLayout;
        let h = Handle::new(FileType::Pack, "ab34ef");
        assert_eq!(layout.dirname(&h), "data/ab");
        assert_eq!(layout.filename(&h), "data/ab/ab34ef");
    }

    #[test]
    fn test_config_lives_at_root() {
        let layout = DefaultLayout;
        let h = Handle::config();
        assert_eq!(layout.dirname(&h), "");
        assert_eq!(layout.filename(&h), "config");
    }

    #[test]
    fn test_basedir_recursion() {
        let layout = DefaultLayout;
        assert_eq!(layout.basedir(FileType::Pack), ("data".to_string(), true));
        assert_eq!(
            layout.basedir(FileType::Snapshot),
            ("snapshots".to_string(), false)
        );
    }

    #[test]
    fn test_paths_cover_data_fanout() {
        let paths = DefaultLayout.paths();
        assert_eq!(paths.len(), 5 + 256);
        assert!(paths.contains(&"data/00".to_string()));
        assert!(paths.contains(&"data/ff".to_string()));
        assert!(paths.contains(&"snapshots".to_string()));
    }

    #[test]
    fn test_join() {
        assert_eq!(join(&["data", "ab", "file"]), "data/ab/file");
        assert_eq!(join(&["", "config"]), "config");
        assert_eq!(join(&["keys/", "/k1"]), "keys/k1");
    }
}
