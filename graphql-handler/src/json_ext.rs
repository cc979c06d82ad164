//! Performance oriented JSON manipulation.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// A GraphQL path element that is composed of strings or numbers.
/// e.g `/book/3/name`
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index path element.
    Index(usize),

    /// A key path element.
    Key(String),
}

impl From<&str> for PathElement {
    fn from(key: &str) -> Self {
        PathElement::Key(key.to_string())
    }
}

impl From<usize> for PathElement {
    fn from(index: usize) -> Self {
        PathElement::Index(index)
    }
}

/// A path into the result document.
///
/// This can be composed of strings and numbers
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Default::default())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    /// Returns a new path with `element` appended.
    pub fn join(&self, element: impl Into<PathElement>) -> Self {
        let mut elements = Vec::with_capacity(self.0.len() + 1);
        elements.extend(self.0.iter().cloned());
        elements.push(element.into());
        Path(elements)
    }
}

impl<T> From<T> for Path
where
    T: AsRef<str>,
{
    /// Parses a `/` separated path, numeric segments becoming indexes.
    fn from(s: T) -> Self {
        Self(
            s.as_ref()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(s.to_string()),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in self.iter() {
            write!(f, "/")?;
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}

/// Extension trait for [`Value`].
pub(crate) trait ValueExt {
    /// Walks `path` and returns a mutable reference to the value it points to.
    ///
    /// Only existing values are reached: missing keys and out of bounds indexes give
    /// `None`.
    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value>;
}

impl ValueExt for Value {
    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value> {
        path.iter().try_fold(self, |current, element| match element {
            PathElement::Key(key) => current.as_object_mut()?.get_mut(key.as_str()),
            PathElement::Index(index) => current.as_array_mut()?.get_mut(*index),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn path_serializes_as_mixed_array() {
        let path = Path::from("hero/friends/1/name");
        assert_eq!(
            serde_json::to_string(&path).unwrap(),
            r#"["hero","friends",1,"name"]"#
        );
        assert_eq!(path.to_string(), "/hero/friends/1/name");
    }

    #[test]
    fn join_does_not_mutate_the_parent() {
        let parent = Path::from("hero");
        let child = parent.join(2usize).join("name");
        assert_eq!(parent.len(), 1);
        assert_eq!(child, Path::from("hero/2/name"));
    }

    #[test]
    fn get_path_mut_reaches_existing_values() {
        let mut value = json!({"variables": {"files": [null, null]}});
        *value
            .get_path_mut(&Path::from("variables/files/1"))
            .unwrap() = json!("upload");
        assert_eq!(value, json!({"variables": {"files": [null, "upload"]}}));
    }

    #[test]
    fn get_path_mut_never_grows_containers() {
        let mut value = json!({"variables": {"files": [null], "file": null}});
        assert!(value
            .get_path_mut(&Path::from("variables/files/1"))
            .is_none());
        assert!(value
            .get_path_mut(&Path(vec![
                "variables".into(),
                "files".into(),
                PathElement::Index(usize::MAX),
            ]))
            .is_none());
        assert!(value.get_path_mut(&Path::from("variables/other")).is_none());
        assert!(value
            .get_path_mut(&Path::from("variables/file/0"))
            .is_none());
        assert_eq!(value, json!({"variables": {"files": [null], "file": null}}));
    }

    #[test]
    fn get_path_mut_refuses_to_index_scalars() {
        let mut value = json!({"variables": {"file": 3}});
        assert!(value
            .get_path_mut(&Path::from("variables/file/name"))
            .is_none());
    }
}
