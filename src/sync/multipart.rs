//! Multipart packaging of a JSON body plus ordered binary attachments.
//!
//! Each binary part is sent under [`FILE_FIELD`] and paired with a text field
//! `id_<index>` carrying the attachment's stable local identifier. Transport
//! order is the only positional signal, so parts keep insertion order.

use serde_json::Value;

/// Form field carrying the JSON body.
pub const JSON_FIELD: &str = "data";

/// Form field name shared by all binary parts.
pub const FILE_FIELD: &str = "files";

/// One binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
  /// Stable local identifier, echoed in the `id_<index>` field
  pub stable_id: String,
  pub file_name: String,
  pub mime_type: String,
  pub bytes: Vec<u8>,
}

/// Append-only builder for [`MultipartRequest`].
#[derive(Debug, Clone)]
pub struct MultipartRequestBuilder {
  json_field: String,
  json: Value,
  parts: Vec<FilePart>,
}

impl MultipartRequestBuilder {
  pub fn new(json: Value) -> Self {
    Self {
      json_field: JSON_FIELD.to_string(),
      json,
      parts: Vec::new(),
    }
  }

  /// Use a different field name for the JSON body.
  pub fn json_field(mut self, name: &str) -> Self {
    self.json_field = name.to_string();
    self
  }

  pub fn attachment(
    mut self,
    stable_id: impl Into<String>,
    file_name: impl Into<String>,
    mime_type: impl Into<String>,
    bytes: Vec<u8>,
  ) -> Self {
    self.parts.push(FilePart {
      stable_id: stable_id.into(),
      file_name: file_name.into(),
      mime_type: mime_type.into(),
      bytes,
    });
    self
  }

  pub fn build(self) -> MultipartRequest {
    MultipartRequest {
      json_field: self.json_field,
      json: self.json,
      parts: self.parts,
    }
  }
}

/// Finalized multipart request.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartRequest {
  json_field: String,
  json: Value,
  parts: Vec<FilePart>,
}

impl MultipartRequest {
  pub fn builder(json: Value) -> MultipartRequestBuilder {
    MultipartRequestBuilder::new(json)
  }

  pub fn json(&self) -> &Value {
    &self.json
  }

  pub fn json_field(&self) -> &str {
    &self.json_field
  }

  pub fn parts(&self) -> &[FilePart] {
    &self.parts
  }

  /// `(id_<index>, stable_id)` pairs in insertion order.
  pub fn correlation_fields(&self) -> Vec<(String, String)> {
    self
      .parts
      .iter()
      .enumerate()
      .map(|(index, part)| (format!("id_{}", index), part.stable_id.clone()))
      .collect()
  }

  /// Convert into a reqwest form for transmission.
  pub fn into_form(self) -> Result<reqwest::multipart::Form, reqwest::Error> {
    let correlation = self.correlation_fields();
    let mut form = reqwest::multipart::Form::new().text(self.json_field, self.json.to_string());

    for part in self.parts {
      let file = reqwest::multipart::Part::bytes(part.bytes)
        .file_name(part.file_name)
        .mime_str(&part.mime_type)?;
      form = form.part(FILE_FIELD, file);
    }
    for (field, stable_id) in correlation {
      form = form.text(field, stable_id);
    }

    Ok(form)
  }
}
