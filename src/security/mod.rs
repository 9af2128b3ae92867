//! Security utilities for user-supplied text and HTTP replies

pub mod headers;
pub mod xss;

pub use headers::with_api_security_headers;
pub use xss::{clean_user_text, contains_html_tag, contains_script_pattern, encode_html};
