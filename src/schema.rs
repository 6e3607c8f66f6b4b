//! Record type definitions: attribute metadata and the type registry.
//!
//! A [`RecordType`] declares the shape of one kind of record: its primary
//! key attribute and an ordered set of [`Attribute`]s. Each attribute knows
//! its wire name, its in-memory property name, a default value, whether it
//! is synced to the source, an optional validator, and its kind (scalar or
//! one of three reference shapes).
//!
//! Reference attributes are the seam for store-key translation: incoming
//! server data has ids in these slots, in-memory data has store keys. The
//! type caches which attributes are references so the store can translate
//! without rescanning the declaration on every record.

use crate::TypeName;
use serde_json::Value;
use std::collections::HashMap;

/// A validation function for an attribute value.
///
/// Returns an error message, or `None` if the value is acceptable.
pub type Validator = fn(&Value) -> Option<String>;

/// The shape of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrKind {
    /// A plain value with no id translation.
    Scalar,
    /// A single reference to a record of the named type.
    ToOne(TypeName),
    /// An ordered list of references to records of the named type.
    ToManyList(TypeName),
    /// A keyed set of references: an object whose values are record ids.
    ToManyMap(TypeName),
}

impl AttrKind {
    /// The referenced type, if this is a reference attribute.
    pub fn target(&self) -> Option<&TypeName> {
        match self {
            AttrKind::Scalar => None,
            AttrKind::ToOne(t) | AttrKind::ToManyList(t) | AttrKind::ToManyMap(t) => Some(t),
        }
    }
}

/// A declared attribute on a record type.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Wire name, as the source sends and receives it.
    pub key: String,
    /// In-memory property name. Defaults to the wire name.
    pub property: String,
    /// Value filled in when a record is saved without this attribute.
    pub default: Value,
    /// Never sent to the source when true.
    pub no_sync: bool,
    /// Optional validator; failures surface on the record, they do not
    /// block writes.
    pub validator: Option<Validator>,
    /// Scalar or reference shape.
    pub kind: AttrKind,
}

impl Attribute {
    /// Declare a scalar attribute whose property name equals its wire name.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            property: key.clone(),
            key,
            default: Value::Null,
            no_sync: false,
            validator: None,
            kind: AttrKind::Scalar,
        }
    }

    /// Use a different in-memory property name.
    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = property.into();
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    /// Exclude this attribute from commits and fetch merges.
    pub fn no_sync(mut self) -> Self {
        self.no_sync = true;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_kind(mut self, kind: AttrKind) -> Self {
        self.kind = kind;
        self
    }

    /// Shorthand for a to-one reference.
    pub fn to_one(key: impl Into<String>, target: impl Into<TypeName>) -> Self {
        Self::new(key).with_kind(AttrKind::ToOne(target.into()))
    }

    /// Shorthand for an ordered to-many reference.
    pub fn to_many(key: impl Into<String>, target: impl Into<TypeName>) -> Self {
        Self::new(key).with_kind(AttrKind::ToManyList(target.into()))
    }

    /// Shorthand for a keyed-set reference.
    pub fn to_many_keyed(key: impl Into<String>, target: impl Into<TypeName>) -> Self {
        Self::new(key).with_kind(AttrKind::ToManyMap(target.into()))
    }
}

/// A record type: primary key plus declared attributes.
#[derive(Debug, Clone)]
pub struct RecordType {
    name: TypeName,
    primary_key: String,
    attributes: Vec<Attribute>,
    /// Indexes into `attributes` of reference attributes, cached at
    /// construction.
    ref_attrs: Vec<usize>,
    by_property: HashMap<String, usize>,
    by_key: HashMap<String, usize>,
}

impl RecordType {
    /// Create a type with the default primary key attribute, `id`.
    pub fn new(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".into(),
            attributes: Vec::new(),
            ref_attrs: Vec::new(),
            by_property: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Use a non-default primary key attribute name.
    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    /// Declare an attribute. Declaration order is preserved.
    pub fn with_attribute(mut self, attr: Attribute) -> Self {
        let index = self.attributes.len();
        if !matches!(attr.kind, AttrKind::Scalar) {
            self.ref_attrs.push(index);
        }
        self.by_property.insert(attr.property.clone(), index);
        self.by_key.insert(attr.key.clone(), index);
        self.attributes.push(attr);
        self
    }

    pub fn name(&self) -> &TypeName {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Look up an attribute by its in-memory property name.
    pub fn attribute(&self, property: &str) -> Option<&Attribute> {
        self.by_property.get(property).map(|&i| &self.attributes[i])
    }

    /// Look up an attribute by its wire name.
    pub fn attribute_by_key(&self, key: &str) -> Option<&Attribute> {
        self.by_key.get(key).map(|&i| &self.attributes[i])
    }

    /// Reference attributes, in declaration order.
    pub fn ref_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.ref_attrs.iter().map(|&i| &self.attributes[i])
    }

    /// True if any attribute is a reference.
    pub fn has_refs(&self) -> bool {
        !self.ref_attrs.is_empty()
    }

    /// Fill defaults for declared attributes missing from `data`.
    ///
    /// The primary key is never defaulted.
    pub fn fill_defaults(&self, data: &mut serde_json::Map<String, Value>) {
        for attr in &self.attributes {
            if attr.property == self.primary_key {
                continue;
            }
            if !data.contains_key(&attr.property) && !attr.default.is_null() {
                data.insert(attr.property.clone(), attr.default.clone());
            }
        }
    }

    /// Run validators over `data`, returning one error per failed attribute.
    pub fn validate(&self, data: &serde_json::Map<String, Value>) -> Vec<crate::ValidationError> {
        let mut errors = Vec::new();
        for attr in &self.attributes {
            if let Some(validate) = attr.validator {
                let value = data.get(&attr.property).unwrap_or(&Value::Null);
                if let Some(message) = validate(value) {
                    errors.push(crate::ValidationError {
                        attribute: attr.property.clone(),
                        message,
                    });
                }
            }
        }
        errors
    }

    /// True if the named property may be included in a commit.
    pub fn is_syncable(&self, property: &str) -> bool {
        if property == self.primary_key {
            return false;
        }
        match self.attribute(property) {
            Some(attr) => !attr.no_sync,
            // Undeclared properties are carried locally but never synced.
            None => false,
        }
    }
}

/// Registry of record types known to a store.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<TypeName, RecordType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, record_type: RecordType) -> &mut Self {
        self.types.insert(record_type.name().clone(), record_type);
        self
    }

    /// Builder-style method to register a type.
    pub fn with_type(mut self, record_type: RecordType) -> Self {
        self.add_type(record_type);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RecordType> {
        self.types.get(name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &TypeName> {
        self.types.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_type() -> RecordType {
        RecordType::new("message")
            .with_attribute(Attribute::new("id"))
            .with_attribute(Attribute::new("subject").with_default(json!("")))
            .with_attribute(
                Attribute::new("isUnread")
                    .with_property("unread")
                    .with_default(json!(true)),
            )
            .with_attribute(Attribute::new("draftLocal").no_sync())
            .with_attribute(Attribute::to_many_keyed("mailboxIds", "mailbox"))
    }

    #[test]
    fn lookup_by_property_and_key() {
        let t = message_type();
        assert_eq!(t.attribute("unread").unwrap().key, "isUnread");
        assert_eq!(t.attribute_by_key("isUnread").unwrap().property, "unread");
        assert!(t.attribute("isUnread").is_none());
    }

    #[test]
    fn ref_attributes_cached() {
        let t = message_type();
        let refs: Vec<_> = t.ref_attributes().map(|a| a.key.as_str()).collect();
        assert_eq!(refs, vec!["mailboxIds"]);
        assert!(t.has_refs());
    }

    #[test]
    fn fill_defaults_skips_present_and_primary_key() {
        let t = message_type();
        let mut data = serde_json::Map::new();
        data.insert("subject".into(), json!("hello"));
        t.fill_defaults(&mut data);
        assert_eq!(data.get("subject"), Some(&json!("hello")));
        assert_eq!(data.get("unread"), Some(&json!(true)));
        assert!(!data.contains_key("id"));
    }

    #[test]
    fn no_sync_and_primary_key_not_syncable() {
        let t = message_type();
        assert!(!t.is_syncable("id"));
        assert!(!t.is_syncable("draftLocal"));
        assert!(t.is_syncable("subject"));
        assert!(!t.is_syncable("somethingUndeclared"));
    }

    #[test]
    fn validators_report_failures() {
        fn not_empty(value: &Value) -> Option<String> {
            match value.as_str() {
                Some(s) if !s.is_empty() => None,
                _ => Some("must be a non-empty string".into()),
            }
        }
        let t = RecordType::new("tag")
            .with_attribute(Attribute::new("id"))
            .with_attribute(Attribute::new("name").with_validator(not_empty));

        let mut data = serde_json::Map::new();
        data.insert("name".into(), json!(""));
        let errors = t.validate(&data);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].attribute, "name");

        data.insert("name".into(), json!("inbox"));
        assert!(t.validate(&data).is_empty());
    }

    #[test]
    fn schema_registry() {
        let schema = Schema::new().with_type(message_type());
        assert!(schema.get("message").is_some());
        assert!(schema.get("thread").is_none());
    }
}
