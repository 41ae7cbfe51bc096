pub mod html;
pub mod url;

pub use html::{extract_language, extract_links, extract_text, extract_title};
pub use url::{get_domain, is_valid_link, normalize};
