use super::{SignatureError, SignatureNode, TypeCode, MAX_DEPTH, MAX_SIGNATURE_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Array,
    Struct,
    Dict,
}

struct Frame {
    kind: Kind,
    children: Vec<SignatureNode>,
}

/// Parse a signature in a single left-to-right pass with a stack of open
/// containers.
///
/// The empty string is valid and parses to an empty list.
pub(crate) fn parse(signature: &str) -> Result<Vec<SignatureNode>, SignatureError> {
    if signature.len() > MAX_SIGNATURE_LENGTH {
        return Err(SignatureError::SignatureTooLong);
    }

    let mut stack = Vec::<Frame>::new();
    let mut top_level = Vec::new();

    for &byte in signature.as_bytes() {
        match byte {
            b'a' => push(&mut stack, Kind::Array)?,
            b'(' => push(&mut stack, Kind::Struct)?,
            b'{' => {
                if !matches!(stack.last(), Some(frame) if frame.kind == Kind::Array) {
                    return Err(SignatureError::DictEntryNotInsideArray);
                }

                push(&mut stack, Kind::Dict)?;
            }
            b')' => {
                let frame = match stack.pop() {
                    Some(frame) if frame.kind == Kind::Struct => frame,
                    Some(frame) if frame.kind == Kind::Array => {
                        return Err(SignatureError::MissingArrayElementType);
                    }
                    _ => return Err(SignatureError::StructEndedButNotStarted),
                };

                if frame.children.is_empty() {
                    return Err(SignatureError::StructHasNoFields);
                }

                complete(
                    &mut stack,
                    &mut top_level,
                    SignatureNode::structure(frame.children),
                );
            }
            b'}' => {
                let frame = match stack.pop() {
                    Some(frame) if frame.kind == Kind::Dict => frame,
                    Some(frame) if frame.kind == Kind::Array => {
                        return Err(SignatureError::MissingArrayElementType);
                    }
                    _ => return Err(SignatureError::DictEndedButNotStarted),
                };

                let mut children = frame.children.into_iter();

                let (key, value) = match (children.next(), children.next(), children.next()) {
                    (Some(key), Some(value), None) => (key, value),
                    (None, ..) => return Err(SignatureError::DictEntryHasNoFields),
                    (Some(..), None, ..) => return Err(SignatureError::DictEntryHasOnlyOneField),
                    _ => return Err(SignatureError::DictEntryHasTooManyFields),
                };

                if !key.code().is_basic() {
                    return Err(SignatureError::DictKeyMustBeBasicType);
                }

                complete(
                    &mut stack,
                    &mut top_level,
                    SignatureNode::dict_entry(key, value),
                );
            }
            byte => {
                let Some(code) = TypeCode::from_basic_byte(byte) else {
                    return Err(SignatureError::UnknownTypeCode(byte));
                };

                complete(&mut stack, &mut top_level, SignatureNode::basic(code));
            }
        }
    }

    match stack.pop() {
        None => Ok(top_level),
        Some(frame) => Err(match frame.kind {
            Kind::Array => SignatureError::MissingArrayElementType,
            Kind::Struct => SignatureError::StructStartedButNotEnded,
            Kind::Dict => SignatureError::DictStartedButNotEnded,
        }),
    }
}

fn push(stack: &mut Vec<Frame>, kind: Kind) -> Result<(), SignatureError> {
    if stack.len() == MAX_DEPTH {
        return Err(SignatureError::ExceededMaximumRecursion);
    }

    stack.push(Frame {
        kind,
        children: Vec::new(),
    });

    Ok(())
}

/// Attach a completed node to the innermost open container, or to the top
/// level. Completing the element of an array completes the array itself, so
/// arrays unwind here.
fn complete(stack: &mut Vec<Frame>, top_level: &mut Vec<SignatureNode>, node: SignatureNode) {
    let mut node = node;

    loop {
        match stack.last_mut() {
            None => {
                top_level.push(node);
                return;
            }
            Some(frame) if frame.kind == Kind::Array => {
                stack.pop();
                node = SignatureNode::array(node);
            }
            Some(frame) => {
                frame.children.push(node);
                return;
            }
        }
    }
}
