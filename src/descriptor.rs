use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Parameter of a JVM method descriptor with its local variable slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ParameterShape {
    pub(crate) is_object: bool,
    pub(crate) slot: u16,
}

/// Parameter layout and return kind of a JVM method descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodShape {
    pub(crate) parameters: Vec<ParameterShape>,
    pub(crate) return_kind: ReturnKind,
}

/// Return kind of a JVM method descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReturnKind {
    Void,
    Primitive,
    Reference,
}

/// Compute parameter slots for a method. The receiver occupies slot 0 of
/// instance methods and is not listed as a parameter.
pub(crate) fn method_shape(descriptor: &str, is_static: bool) -> Result<MethodShape> {
    let parsed = MethodDescriptor::from_str(descriptor)
        .with_context(|| format!("parse method descriptor {descriptor}"))?;
    let mut slot: u16 = if is_static { 0 } else { 1 };
    let mut parameters = Vec::with_capacity(parsed.parameter_types().len());
    for param in parsed.parameter_types() {
        parameters.push(ParameterShape {
            is_object: matches!(param, TypeDescriptor::Object(_)),
            slot,
        });
        let width = if matches!(param, TypeDescriptor::Long | TypeDescriptor::Double) {
            2
        } else {
            1
        };
        slot = slot
            .checked_add(width)
            .context("method parameters exceed the local variable limit")?;
    }
    let return_kind = match parsed.return_type() {
        TypeDescriptor::Void => ReturnKind::Void,
        TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => ReturnKind::Reference,
        _ => ReturnKind::Primitive,
    };
    Ok(MethodShape {
        parameters,
        return_kind,
    })
}

/// Returns true when a field descriptor names a class or interface type.
pub(crate) fn is_object_field(descriptor: &str) -> bool {
    descriptor.starts_with('L') && descriptor.ends_with(';')
}
