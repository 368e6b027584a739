use std::fmt::{Debug, Formatter};

pub const MESSAGE_ID: &str = "MessageId";

/// number of bytes of the serialized body
pub const CONTENT_LENGTH: &str = "Content-Length";

/// the application level type being transported
pub const TYPE_NAME: &str = "Type-Name";

/// serialization format of the body
pub const CONTENT_TYPE: &str = "Content-Type";

pub const CORRELATION_ID: &str = "CorrelationId";


/// Message headers: string keys and values with unique keys. Iteration order is insertion
///  order, which is also the order in which headers go on the wire.
///
/// NB: Messages carry a handful of headers, so a linear scan beats hashing here
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a header's value. Replacing an existing header keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item=(&str, &str)> {
        self.entries.iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Debug for Headers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.iter())
            .finish()
    }
}

impl <N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item=(N, V)>>(iter: T) -> Self {
        let mut result = Headers::new();
        for (n, v) in iter {
            result.insert(n, v);
        }
        result
    }
}
