// Command builder
//
// Commands are plain data so the pool can replay them on a fresh session
// after a connection-level failure.

use std::fmt;

/// A single API command: menu path, `=attr=` words, and `?query` words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    path: String,
    attributes: Vec<(String, String)>,
    queries: Vec<String>,
}

impl Command {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attributes: Vec::new(),
            queries: Vec::new(),
        }
    }

    /// `<menu>/print`
    pub fn print(menu: &str) -> Self {
        Self::new(format!("{menu}/print"))
    }

    /// `<menu>/add`
    pub fn add(menu: &str) -> Self {
        Self::new(format!("{menu}/add"))
    }

    /// `<menu>/set =.id=<id>`
    pub fn set(menu: &str, id: &str) -> Self {
        Self::new(format!("{menu}/set")).attr(".id", id)
    }

    /// `<menu>/remove =.id=<id>`
    pub fn remove(menu: &str, id: &str) -> Self {
        Self::new(format!("{menu}/remove")).attr(".id", id)
    }

    #[must_use]
    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.push((key.to_owned(), value.into()));
        self
    }

    /// Attribute added only when `value` is present.
    #[must_use]
    pub fn attr_opt(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.attr(key, v),
            None => self,
        }
    }

    /// Exact-match filter (`?key=value`).
    #[must_use]
    pub fn query(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.queries.push(format!("?{key}={}", value.as_ref()));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn words(&self) -> Vec<String> {
        let mut words = Vec::with_capacity(1 + self.attributes.len() + self.queries.len());
        words.push(self.path.clone());
        for (key, value) in &self.attributes {
            words.push(format!("={key}={value}"));
        }
        words.extend(self.queries.iter().cloned());
        words
    }
}

impl fmt::Display for Command {
    /// Path plus attribute keys; values are omitted so secrets never reach logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        for (key, _) in &self.attributes {
            write!(f, " ={key}=…")?;
        }
        for query in &self.queries {
            write!(f, " {query}")?;
        }
        Ok(())
    }
}
