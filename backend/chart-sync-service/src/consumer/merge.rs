//! Idempotent merge of lab result fragments into encounter notes.
//!
//! Each merged lab result is wrapped in a section carrying its id:
//!
//! ```text
//! <section data-lab-result-id="6">
//! ...
//! </section>
//! ```
//!
//! Re-merging the same id replaces that section instead of appending a new
//! one, so redelivered messages converge on the same notes.

use crate::models::{LabResultDocument, Observation};

pub const CLOSING_TAG: &str = "</section>";

/// Content and mode of the downstream notes update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub content: String,
    /// `true`: `content` is the full rewritten notes.
    /// `false`: `content` is a fragment to append.
    pub replace: bool,
}

pub fn marker(record_id: &str) -> String {
    format!(r#"<section data-lab-result-id="{}">"#, escape(record_id))
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn render_observation(obs: &Observation) -> String {
    let mut line = format!("<li>{}", escape(&obs.name));
    if let Some(value) = obs.value.as_deref().filter(|v| !v.is_empty()) {
        line.push_str(": ");
        line.push_str(&escape(value));
        if let Some(units) = obs.units.as_deref().filter(|u| !u.is_empty()) {
            line.push(' ');
            line.push_str(&escape(units));
        }
    }
    if let Some(range) = obs.reference_range.as_deref().filter(|r| !r.is_empty()) {
        line.push_str(&format!(" (ref: {})", escape(range)));
    }
    if let Some(flag) = obs.abnormal_flag.as_deref().filter(|f| !f.is_empty()) {
        line.push_str(&format!(" [{}]", escape(flag)));
    }
    line.push_str("</li>");
    line
}

/// Render the notes section for a lab result's observations.
pub fn render_fragment(doc: &LabResultDocument) -> String {
    let title = doc
        .description
        .as_deref()
        .filter(|d| !d.is_empty())
        .unwrap_or("Lab result");

    let mut out = marker(&doc.id);
    out.push('\n');
    out.push_str("<h4>");
    out.push_str(&escape(title));
    if let Some(date) = doc.result_date.as_deref().filter(|d| !d.is_empty()) {
        out.push_str(" (");
        out.push_str(&escape(date));
        out.push(')');
    }
    out.push_str("</h4>\n<ul>\n");
    for obs in &doc.observations {
        out.push_str(&render_observation(obs));
        out.push('\n');
    }
    out.push_str("</ul>\n");
    out.push_str(CLOSING_TAG);
    out
}

/// Decide how `fragment` for `record_id` lands in `existing` notes.
///
/// If the record's marker is present, the block from the marker through the
/// next closing tag (or the end of the notes, if the tag is missing) is
/// replaced. Otherwise the fragment is appended as a plain insert.
pub fn plan_merge(existing: &str, record_id: &str, fragment: &str) -> MergePlan {
    let marker = marker(record_id);

    let Some(start) = existing.find(&marker) else {
        return MergePlan {
            content: fragment.to_string(),
            replace: false,
        };
    };

    let end = existing[start..]
        .find(CLOSING_TAG)
        .map(|i| start + i + CLOSING_TAG.len())
        .unwrap_or(existing.len());

    let mut content = String::with_capacity(existing.len() - (end - start) + fragment.len());
    content.push_str(&existing[..start]);
    content.push_str(fragment);
    content.push_str(&existing[end..]);

    MergePlan {
        content,
        replace: true,
    }
}
