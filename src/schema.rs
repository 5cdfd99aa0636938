//! Column schemas threaded between pipeline steps

use std::fmt;

use serde::{Deserialize, Serialize};

/// Abstract column type tag
///
/// Only used for structural validation, never checked against the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Numeric,
    #[default]
    Unknown,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Numeric => write!(f, "numeric"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" | "text" | "varchar" => Ok(Self::String),
            "numeric" | "number" | "integer" | "double" => Ok(Self::Numeric),
            "unknown" | "" => Ok(Self::Unknown),
            _ => Err(format!("Unknown column type: {}", s)),
        }
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::String)
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Numeric)
    }

    pub fn unknown(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Unknown)
    }
}

impl From<&str> for Column {
    fn from(name: &str) -> Self {
        Column::unknown(name)
    }
}

impl From<String> for Column {
    fn from(name: String) -> Self {
        Column::unknown(name)
    }
}

impl From<(&str, ColumnType)> for Column {
    fn from((name, ty): (&str, ColumnType)) -> Self {
        Column::new(name, ty)
    }
}

/// Ordered mapping from column name to type tag. Names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Column>", try_from = "Vec<Column>")]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from columns; a repeated name replaces the earlier entry in place
    pub fn from_columns<I, C>(columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
    {
        let mut schema = Self::new();
        for column in columns {
            schema.upsert(column.into());
        }
        schema
    }

    /// Builder-style [`Schema::upsert`]
    pub fn with(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.upsert(Column::new(name, ty));
        self
    }

    /// Insert a column, replacing an existing column of the same name in place
    pub fn upsert(&mut self, column: Column) {
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }

    /// Append a column at the end, removing any existing column of the same name
    pub fn push_back(&mut self, column: Column) {
        self.remove(&column.name);
        self.columns.push(column);
    }

    /// Remove a column by name, returning it if it was present
    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let position = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(position))
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Names from `required` absent from this schema, in the order given
    pub fn missing<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut missing: Vec<String> = Vec::new();
        for name in required {
            if !self.contains(name) && !missing.contains(name) {
                missing.push(name.clone());
            }
        }
        missing
    }

    /// Restrict the schema to `names`, in that order
    pub fn project(&self, names: &[String]) -> Result<Schema, Vec<String>> {
        let missing = self.missing(names);
        if !missing.is_empty() {
            return Err(missing);
        }
        Ok(Schema::from_columns(
            names.iter().filter_map(|n| self.get(n).cloned()),
        ))
    }

    /// Same columns by name, ignoring order and types
    pub fn same_names(&self, other: &Schema) -> bool {
        self.len() == other.len() && self.columns.iter().all(|c| other.contains(&c.name))
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", column.name, column.ty)?;
        }
        write!(f, "}}")
    }
}

impl TryFrom<Vec<Column>> for Schema {
    type Error = String;

    /// Rejects a repeated column name instead of replacing the earlier entry
    fn try_from(columns: Vec<Column>) -> Result<Self, Self::Error> {
        let mut schema = Self::new();
        for column in columns {
            if schema.contains(&column.name) {
                return Err(format!("Column '{}' appears more than once", column.name));
            }
            schema.columns.push(column);
        }
        Ok(schema)
    }
}

impl From<Schema> for Vec<Column> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}

impl<C: Into<Column>> FromIterator<C> for Schema {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Schema::from_columns(iter)
    }
}
