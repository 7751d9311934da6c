use crate::instance::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DocumentId = u64;

/// Stored document attached to a process instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    /// Position inside a document list; `None` for a single document
    pub index: Option<usize>,
    pub content_file_name: Option<String>,
    pub content_mime_type: Option<String>,
    pub url: Option<String>,
    pub content: Option<Vec<u8>>,
    pub description: Option<String>,
    pub author: UserId,
    pub creation_date: DateTime<Utc>,
}

impl Document {
    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// Builds an unsaved document from an operation value; the store assigns the id.
    pub fn from_value(
        name: impl Into<String>,
        index: Option<usize>,
        value: &DocumentValue,
        author: UserId,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            index,
            content_file_name: value.file_name.clone(),
            content_mime_type: value.mime_type.clone(),
            url: value.url.clone(),
            content: value.content.clone(),
            description: value.description.clone(),
            author,
            creation_date: Utc::now(),
        }
    }
}

/// Content handed to a document operation: new bytes, an external url, or a copy
/// of a document already in context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DocumentValue {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content: Option<Vec<u8>>,
    pub url: Option<String>,
    pub description: Option<String>,
    /// Set when the value was read from an existing document
    pub source_document_id: Option<DocumentId>,
}

impl DocumentValue {
    pub fn with_content(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: Some(file_name.into()),
            mime_type: Some(mime_type.into()),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

impl From<&Document> for DocumentValue {
    fn from(doc: &Document) -> Self {
        Self {
            file_name: doc.content_file_name.clone(),
            mime_type: doc.content_mime_type.clone(),
            content: doc.content.clone(),
            url: doc.url.clone(),
            description: doc.description.clone(),
            source_document_id: Some(doc.id),
        }
    }
}

/// What a document name currently holds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DocumentSlot {
    Single(Document),
    List(Vec<Document>),
}

impl DocumentSlot {
    pub fn documents(&self) -> &[Document] {
        match self {
            DocumentSlot::Single(doc) => std::slice::from_ref(doc),
            DocumentSlot::List(docs) => docs,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, DocumentSlot::List(_))
    }
}
