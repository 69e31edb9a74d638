use std::path::{Path, PathBuf};

use url::Url;

pub trait UrlExt {
    fn with_path(&self, path: &str) -> Url;
}

impl UrlExt for Url {
    #[inline]
    fn with_path(&self, path: &str) -> Url {
        let mut out = self.clone();
        out.set_path(path);
        out.set_query(None);
        out
    }
}

/// Join two paths, only including the normal components.
pub fn join_normalized(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let mut out = base.as_ref().to_path_buf();
    out.extend(path.as_ref().components().filter(|v| matches!(v, std::path::Component::Normal(_))));
    out
}

/// Truncate a string to at most `max` bytes on a character boundary, appending an ellipsis.
pub fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max.saturating_sub(1);
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &value[..end])
}
