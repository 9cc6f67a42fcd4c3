use serde::{Deserialize, Serialize};

use crate::drive::EntryKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub children: Vec<FolderNode>,
}

impl FolderNode {
    fn new(name: &str, path: String) -> FolderNode {
        FolderNode {
            name: name.to_string(),
            path,
            kind: EntryKind::Folder,
            children: Vec::new(),
        }
    }
}

/// Builds a folder tree from slash-separated paths relative to the home directory.
///
/// Siblings keep the order in which they first appear in `paths`. Blank entries
/// and empty segments are skipped, and a prefix seen before is reused rather
/// than duplicated.
pub fn build_tree<I, S>(paths: I) -> Vec<FolderNode>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut roots: Vec<FolderNode> = Vec::new();

    for path in paths {
        let path = path.as_ref();
        if path.trim().is_empty() {
            continue;
        }

        let mut level = &mut roots;
        let mut cumulative = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            if !cumulative.is_empty() {
                cumulative.push('/');
            }
            cumulative.push_str(part);

            let index = match level.iter().position(|node| node.name == part) {
                Some(index) => index,
                None => {
                    level.push(FolderNode::new(part, cumulative.clone()));
                    level.len() - 1
                }
            };
            level = &mut level[index].children;
        }
    }

    roots
}
