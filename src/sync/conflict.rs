//! Maps server error bodies to semantic conflict classes.

use super::types::ConflictType;

/// Token the server includes when a record already exists.
pub const DUPLICATE_TOKEN: &str = "duplicado";

/// Token the server includes when a movement exceeds available stock.
pub const INSUFFICIENT_STOCK_TOKEN: &str = "stock_insuficiente";

/// Ordered list of `(token, conflict type)` rules.
///
/// Matching is a case-insensitive substring search; the first matching rule
/// wins and an absent or unrecognized body is `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictClassifier {
  rules: Vec<(String, ConflictType)>,
}

impl Default for ConflictClassifier {
  fn default() -> Self {
    Self::empty()
      .rule(DUPLICATE_TOKEN, ConflictType::Duplicate)
      .rule(INSUFFICIENT_STOCK_TOKEN, ConflictType::InsufficientStock)
  }
}

impl ConflictClassifier {
  /// Classifier with no rules; everything is `Other`.
  pub fn empty() -> Self {
    Self { rules: Vec::new() }
  }

  /// Append a rule. Earlier rules take precedence.
  pub fn rule(mut self, token: &str, conflict_type: ConflictType) -> Self {
    self.rules.push((token.to_lowercase(), conflict_type));
    self
  }

  pub fn classify(&self, body: Option<&str>) -> ConflictType {
    let body = match body {
      Some(b) => b.to_lowercase(),
      None => return ConflictType::Other,
    };

    self
      .rules
      .iter()
      .find(|(token, _)| body.contains(token.as_str()))
      .map(|(_, conflict_type)| *conflict_type)
      .unwrap_or(ConflictType::Other)
  }

  /// Like `classify`, but `None` when no rule matched.
  pub fn recognize(&self, body: Option<&str>) -> Option<ConflictType> {
    match self.classify(body) {
      ConflictType::Other => None,
      known => Some(known),
    }
  }
}

/// Classify with the default rules.
pub fn classify_conflict(body: Option<&str>) -> ConflictType {
  ConflictClassifier::default().classify(body)
}
