use std::collections::HashMap;
use std::env;
use std::ffi::CString;
use std::fs;
use std::io;

/// The path-search collaborator: maps bare program names to executable
/// paths, rebuilt on demand by the `rehash` builtin.
pub struct SearchCache {
    imp: HashMap<String, CString>,
}

impl SearchCache {
    pub fn new() -> SearchCache {
        let mut this = SearchCache {
            imp: HashMap::new(),
        };
        this.rehash();
        this
    }

    fn add_entry(&mut self, entry: io::Result<fs::DirEntry>) -> io::Result<()> {
        use std::os::unix::ffi::OsStringExt;
        let entry = entry?;
        let Ok(file_name) = entry.file_name().into_string() else {
            return Ok(());
        };
        let path = CString::new(entry.path().into_os_string().into_vec())?;
        self.imp.entry(file_name).or_insert(path);
        Ok(())
    }

    /// Scans the directories of PATH front to back; the first directory
    /// providing a name wins.
    pub fn rehash(&mut self) {
        self.imp.clear();
        let path = env::var_os("PATH").unwrap_or_default();
        for dir in env::split_paths(&path) {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries {
                    let _ = self.add_entry(entry);
                }
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&CString> {
        self.imp.get(name)
    }
}
