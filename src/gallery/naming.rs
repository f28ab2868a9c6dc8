// Page URL and archive filename derivation.

use crate::config::MAX_FILENAME_BYTES;

use super::traits::{Gallery, GalleryTitle};

/// Map a page type code to its file extension.
pub fn page_extension(code: &str) -> &'static str {
    match code {
        "j" => "jpg",
        "g" => "gif",
        "w" => "webp",
        _ => "png",
    }
}

/// Build the ordered page URL list for a gallery. Page numbering is 1-based.
pub fn page_urls(image_host: &str, gallery: &Gallery) -> Vec<String> {
    let host = image_host.trim_end_matches('/');
    gallery
        .images
        .pages
        .iter()
        .enumerate()
        .map(|(index, page)| {
            format!(
                "{}/galleries/{}/{}.{}",
                host,
                gallery.media_id,
                index + 1,
                page_extension(&page.t)
            )
        })
        .collect()
}

/// Replace characters that are forbidden in filenames on common filesystems.
fn sanitize(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' => '_',
            other => other,
        })
        .collect()
}

fn titled(id: u64, title: &str) -> String {
    format!("[{}] {}.zip", id, sanitize(title))
}

/// Derive the archive filename for a gallery.
///
/// Preference order is english, japanese, pretty. If the resulting name
/// exceeds the filesystem limit in UTF-8 bytes, retry with the (usually
/// shorter) pretty title, and finally fall back to the bare id. Titles are
/// never truncated mid-character.
pub fn archive_filename(id: u64, title: &GalleryTitle) -> String {
    let preferred = title
        .english
        .as_deref()
        .or(title.japanese.as_deref())
        .or(title.pretty.as_deref());

    if let Some(t) = preferred {
        let name = titled(id, t);
        if name.len() <= MAX_FILENAME_BYTES {
            return name;
        }
        if let Some(pretty) = title.pretty.as_deref() {
            let name = titled(id, pretty);
            if name.len() <= MAX_FILENAME_BYTES {
                return name;
            }
        }
    }

    format!("{}.zip", id)
}
