//! The D-Bus signature model.
//!
//! A signature string is compiled into a list of [`SignatureNode`] trees, one
//! per complete type. The trees drive marshalling, unmarshalling and
//! introspection; they are immutable and cached process-wide by their source
//! string.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

pub use self::node::{SignatureNode, TypeCode};
mod node;

pub use self::signature_error::SignatureError;
mod signature_error;

pub(crate) use self::parse::parse;
mod parse;


/// Maximum number of nested containers in a signature.
pub(crate) const MAX_DEPTH: usize = 32;

/// Maximum length in bytes of a signature string.
pub(crate) const MAX_SIGNATURE_LENGTH: usize = 255;

/// Parse a signature string into its complete types.
///
/// Results are cached process-wide: parsing is deterministic and the returned
/// trees are immutable, so repeated parses of the same string share one
/// allocation.
///
/// # Examples
///
/// ```
/// use async_dbus::signature::parse_signature;
///
/// let nodes = parse_signature("a{sv}u")?;
/// assert_eq!(nodes.len(), 2);
/// assert_eq!(nodes[0].text(), "a{sv}");
/// # Ok::<_, async_dbus::signature::SignatureError>(())
/// ```
pub fn parse_signature(signature: &str) -> Result<Arc<[SignatureNode]>, SignatureError> {
    static CACHE: OnceLock<Mutex<HashMap<Box<str>, Arc<[SignatureNode]>>>> = OnceLock::new();

    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    {
        let guard = cache.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(hit) = guard.get(signature) {
            return Ok(hit.clone());
        }
    }

    let nodes: Arc<[SignatureNode]> = parse(signature)?.into();

    let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
    guard.insert(signature.into(), nodes.clone());
    Ok(nodes)
}

/// Parse a signature string which must contain exactly one complete type.
pub fn parse_single(signature: &str) -> Result<SignatureNode, SignatureError> {
    let nodes = parse_signature(signature)?;

    match &*nodes {
        [node] => Ok(node.clone()),
        _ => Err(SignatureError::NotSingleCompleteType),
    }
}

/// Reconstitute the source text of a list of signature nodes.
pub fn signature_string(nodes: &[SignatureNode]) -> String {
    let mut out = String::new();

    for node in nodes {
        node.write_text(&mut out);
    }

    out
}
