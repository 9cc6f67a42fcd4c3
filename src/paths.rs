use std::fmt;

use crate::error::{Error, Result};

/// A remote path that is known to live inside the home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    home: String,
    segments: Vec<String>,
}

impl RemotePath {
    /// Resolves a browser-supplied path against the remote home directory.
    ///
    /// Empty means the home directory itself. A path already under `home` is
    /// taken as-is, anything else (absolute or not) is placed under `home`.
    /// `..` may walk back up, but never above `home`.
    pub fn resolve(home: &str, requested: &str) -> Result<RemotePath> {
        let home = normalize_home(home)?;
        let rest = strip_home(&home, requested).unwrap_or(requested);

        let mut segments: Vec<String> = Vec::new();
        for part in rest.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(Error::PathEscapesHome(requested.to_string()));
                    }
                }
                part => segments.push(part.to_string()),
            }
        }

        Ok(RemotePath { home, segments })
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn is_home(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn absolute(&self) -> String {
        if self.segments.is_empty() {
            return self.home.clone();
        }
        let mut path = if self.home == "/" { String::new() } else { self.home.clone() };
        for segment in &self.segments {
            path.push('/');
            path.push_str(segment);
        }
        path
    }

    /// The path relative to the home directory, without a leading slash.
    pub fn relative(&self) -> String {
        self.segments.join("/")
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn join(&self, child: &str) -> Result<RemotePath> {
        let mut combined = self.relative();
        combined.push('/');
        combined.push_str(child);
        RemotePath::resolve(&self.home, &combined)
    }

    /// `name` relative to the home directory, as shown to the browser.
    pub fn relative_child(&self, name: &str) -> String {
        if self.segments.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.relative(), name)
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute())
    }
}

/// Strips `home` from an absolute path under it, component-wise.
pub(crate) fn strip_home<'a>(home: &str, path: &'a str) -> Option<&'a str> {
    if home == "/" {
        return path.strip_prefix('/');
    }
    let rest = path.strip_prefix(home)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

fn normalize_home(home: &str) -> Result<String> {
    let home = home.trim();
    if !home.starts_with('/') {
        return Err(Error::Protocol(format!("home directory {home:?} is not absolute")));
    }
    let trimmed = home.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".into() } else { trimmed.into() })
}
