//! CV-011: Hierarchical vertex IDs.
//!
//! IDs are `/`-separated paths rooted at `root`; the last segment is
//! `kind.name` (e.g. `root/module.web/task.install`).

/// ID of the root vertex of every loaded graph.
pub const ROOT: &str = "root";

/// Append a segment to a parent ID.
pub fn join(parent: &str, segment: &str) -> String {
    format!("{}/{}", parent, segment)
}

/// Parent of an ID, or `None` for the root.
pub fn parent(id: &str) -> Option<&str> {
    id.rfind('/').map(|i| &id[..i])
}

/// Last segment of an ID.
pub fn segment(id: &str) -> &str {
    match id.rfind('/') {
        Some(i) => &id[i + 1..],
        None => id,
    }
}

/// Build the segment for a node of `kind` named `name`.
pub fn node_segment(kind: &str, name: &str) -> String {
    format!("{}.{}", kind, name)
}

/// Whether the segment names a module call vertex.
pub fn is_module(id: &str) -> bool {
    segment(id).starts_with("module.")
}

/// Whether the segment names a param vertex.
pub fn is_param(id: &str) -> bool {
    segment(id).starts_with("param.")
}

/// Whether `id` lives directly or transitively under `ancestor`.
pub fn is_under(id: &str, ancestor: &str) -> bool {
    id.len() > ancestor.len() && id.starts_with(ancestor) && id.as_bytes()[ancestor.len()] == b'/'
}

/// Rename an ID from one root prefix to another (`root/x` under `root/module.m` → `root/module.m/x`).
pub fn rebase(id: &str, from: &str, to: &str) -> String {
    if id == from {
        to.to_string()
    } else if is_under(id, from) {
        format!("{}{}", to, &id[from.len()..])
    } else {
        id.to_string()
    }
}

/// ID relative to the root, for user-facing messages.
pub fn friendly(id: &str) -> &str {
    id.strip_prefix("root/").unwrap_or(id)
}
