//! Deterministic dataset naming.
//!
//! The resolver maps a CSI volume identity plus storage-class naming knobs
//! to the leaf dataset segment. Determinism matters: the same volume name
//! with the same storage class must always produce the same path, or
//! adoption breaks.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ControllerError, Result};
use crate::params::StorageClassParams;

/// ZFS caps name components at 255 bytes; stay comfortably below so the
/// full `pool/.../leaf@snapshot` still fits.
const MAX_LEAF_LEN: usize = 200;

/// Template placeholders recognized in `nameTemplate`.
const PLACEHOLDERS: [(&str, for<'a> fn(&'a NameInputs<'a>) -> &'a str); 3] = [
    ("{{volumeName}}", |i| i.volume_name),
    ("{{pvcName}}", |i| i.pvc_name),
    ("{{pvcNamespace}}", |i| i.pvc_namespace),
];

fn sanitizer() -> &'static Regex {
    static SANITIZER: OnceLock<Regex> = OnceLock::new();
    SANITIZER.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("Invalid regex pattern"))
}

/// Identity fields available to the template.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameInputs<'a> {
    pub volume_name: &'a str,
    pub pvc_name: &'a str,
    pub pvc_namespace: &'a str,
}

/// Resolve the leaf dataset segment for a volume.
pub fn resolve_leaf(params: &StorageClassParams, inputs: &NameInputs) -> Result<String> {
    let base = match &params.name_template {
        Some(template) => render(template, inputs)?,
        None => inputs.volume_name.to_string(),
    };

    let sanitized = sanitizer().replace_all(&base, "-");
    let leaf = format!("{}{}{}", params.name_prefix, sanitized, params.name_suffix);

    if leaf.is_empty() {
        return Err(ControllerError::InvalidArgument(
            "resolved dataset name is empty".to_string(),
        ));
    }
    if leaf.len() > MAX_LEAF_LEN {
        return Err(ControllerError::InvalidArgument(format!(
            "resolved dataset name '{}' exceeds {} characters",
            leaf, MAX_LEAF_LEN
        )));
    }
    // Prefix and suffix are operator-supplied and bypass the sanitizer, so
    // validate the final result as a whole.
    if !leaf
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ControllerError::InvalidArgument(format!(
            "resolved dataset name '{}' contains invalid characters",
            leaf
        )));
    }
    if leaf.starts_with('-') || leaf.starts_with('.') {
        return Err(ControllerError::InvalidArgument(format!(
            "resolved dataset name '{}' must start with a letter or digit",
            leaf
        )));
    }
    Ok(leaf)
}

/// Resolve the full dataset path for a volume.
pub fn resolve_path(params: &StorageClassParams, inputs: &NameInputs) -> Result<String> {
    Ok(format!("{}/{}", params.parent_path(), resolve_leaf(params, inputs)?))
}

fn render(template: &str, inputs: &NameInputs) -> Result<String> {
    let mut rendered = template.to_string();
    for (placeholder, value) in PLACEHOLDERS {
        rendered = rendered.replace(placeholder, value(inputs));
    }
    if rendered.contains("{{") || rendered.contains("}}") {
        return Err(ControllerError::InvalidArgument(format!(
            "name template '{}' contains unknown placeholders",
            template
        )));
    }
    Ok(rendered)
}
