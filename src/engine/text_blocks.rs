//! Slice-marked blocks inside shared documents.
//!
//! Several slices may contribute to the same file (a PRD, a runbook). Each
//! slice owns the text between its own markers and never touches the rest.

fn start_marker(slice_id: i64) -> String {
    format!("<!-- slice:{}:start -->", slice_id)
}

fn end_marker(slice_id: i64) -> String {
    format!("<!-- slice:{}:end -->", slice_id)
}

/// Insert or replace the block owned by `slice_id`.
///
/// An existing well-formed block is replaced in place. Otherwise the block is
/// appended, separated from existing text by a blank line.
pub fn upsert_block(existing: &str, slice_id: i64, content: &str) -> String {
    let start = start_marker(slice_id);
    let end = end_marker(slice_id);
    let block = format!("{}\n{}\n{}", start, content.trim_end_matches('\n'), end);

    if let Some(s) = existing.find(&start)
        && let Some(rel) = existing[s..].find(&end)
    {
        let e = s + rel + end.len();
        return format!("{}{}{}", &existing[..s], block, &existing[e..]);
    }

    if existing.trim().is_empty() {
        return format!("{}\n", block);
    }
    let mut out = existing.trim_end_matches('\n').to_string();
    out.push_str("\n\n");
    out.push_str(&block);
    out.push('\n');
    out
}

/// Extract the text of the block owned by `slice_id`, if present.
pub fn read_block(existing: &str, slice_id: i64) -> Option<&str> {
    let start = start_marker(slice_id);
    let end = end_marker(slice_id);
    let s = existing.find(&start)? + start.len();
    let e = s + existing[s..].find(&end)?;
    Some(existing[s..e].trim_matches('\n'))
}
