use anyhow::{Context, Result};
use tracing::warn;

use crate::classfile::annotations::{
    RUNTIME_INVISIBLE_ANNOTATIONS, RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS,
    RUNTIME_VISIBLE_ANNOTATIONS, RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS, annotation_type_indexes,
    parameter_annotation_type_indexes,
};
use crate::classfile::code::CODE;
use crate::classfile::{AttributeInfo, ClassFile, MemberInfo};
use crate::descriptor::{ReturnKind, is_object_field, method_shape};

pub(crate) const NOT_NULL_DESCRIPTOR: &str = "Lnotnullcheckweaver/NotNull;";
pub(crate) const NULLABLE_DESCRIPTOR: &str = "Lnotnullcheckweaver/Nullable;";

/// Explicit nullness annotations found on one element.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Markers {
    pub(crate) not_null: bool,
    pub(crate) nullable: bool,
}

impl Markers {
    #[cfg(test)]
    pub(crate) const NOT_NULL: Self = Self {
        not_null: true,
        nullable: false,
    };
    #[cfg(test)]
    pub(crate) const NULLABLE: Self = Self {
        not_null: false,
        nullable: true,
    };

    /// The explicit verdict, if any. `@NotNull` wins when both are present.
    pub(crate) fn explicit(self) -> Option<bool> {
        if self.not_null {
            Some(true)
        } else if self.nullable {
            Some(false)
        } else {
            None
        }
    }

    pub(crate) fn is_conflicting(self) -> bool {
        self.not_null && self.nullable
    }

    fn record(&mut self, descriptor: &[u8]) {
        if descriptor == NOT_NULL_DESCRIPTOR.as_bytes() {
            self.not_null = true;
        } else if descriptor == NULLABLE_DESCRIPTOR.as_bytes() {
            self.nullable = true;
        }
    }
}

/// Field identity used to match field instructions: name plus descriptor.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct FieldKey {
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

#[derive(Clone, Debug)]
pub(crate) struct FieldModel {
    pub(crate) key: FieldKey,
    pub(crate) is_static: bool,
    pub(crate) is_object: bool,
    pub(crate) markers: Markers,
}

#[derive(Clone, Debug)]
pub(crate) struct ParameterModel {
    /// Zero-based position in the descriptor, receiver not counted.
    pub(crate) index: usize,
    /// Local variable slot holding the argument on entry.
    pub(crate) slot: u16,
    pub(crate) is_object: bool,
    pub(crate) markers: Markers,
}

#[derive(Clone, Debug)]
pub(crate) struct MethodModel {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) has_code: bool,
    pub(crate) parameters: Vec<ParameterModel>,
    pub(crate) return_kind: ReturnKind,
    pub(crate) return_markers: Markers,
}

impl MethodModel {
    pub(crate) fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub(crate) fn is_static_initializer(&self) -> bool {
        self.name == "<clinit>"
    }
}

/// Annotation view of one class, in declaration order.
#[derive(Clone, Debug)]
pub(crate) struct ClassModel {
    pub(crate) name: String,
    pub(crate) is_interface: bool,
    pub(crate) markers: Markers,
    pub(crate) fields: Vec<FieldModel>,
    pub(crate) methods: Vec<MethodModel>,
}

impl ClassModel {
    pub(crate) fn from_class(class: &ClassFile) -> Result<Self> {
        let name = class.name()?;
        let markers = element_markers(class, &class.attributes).context("read class annotations")?;
        warn_conflict(&name, "class", markers);

        let mut fields = Vec::with_capacity(class.fields.len());
        for field in &class.fields {
            let key = FieldKey {
                name: class.member_name(field)?,
                descriptor: class.member_descriptor(field)?,
            };
            let markers = element_markers(class, &field.attributes)
                .with_context(|| format!("read annotations of field {}", key.name))?;
            warn_conflict(&name, &format!("field {}", key.name), markers);
            fields.push(FieldModel {
                is_static: field.is_static(),
                is_object: is_object_field(&key.descriptor),
                key,
                markers,
            });
        }

        let mut methods = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            let model = method_model(class, method)?;
            warn_conflict(&name, &format!("method {}{}", model.name, model.descriptor), model.return_markers);
            for parameter in &model.parameters {
                warn_conflict(
                    &name,
                    &format!("parameter {} of {}{}", parameter.index, model.name, model.descriptor),
                    parameter.markers,
                );
            }
            methods.push(model);
        }

        Ok(Self {
            name,
            is_interface: class.is_interface(),
            markers,
            fields,
            methods,
        })
    }

    /// Package of the class in internal form; empty for the default package.
    pub(crate) fn package(&self) -> &str {
        package_of(&self.name)
    }
}

pub(crate) fn package_of(class_name: &str) -> &str {
    class_name
        .rsplit_once('/')
        .map(|(package, _)| package)
        .unwrap_or("")
}

/// Markers declared directly on a class, field or method.
pub(crate) fn element_markers(class: &ClassFile, attributes: &[AttributeInfo]) -> Result<Markers> {
    let mut markers = Markers::default();
    for attribute in attributes {
        let pool = &class.constant_pool;
        if !pool.utf8_eq(attribute.name_index, RUNTIME_VISIBLE_ANNOTATIONS)
            && !pool.utf8_eq(attribute.name_index, RUNTIME_INVISIBLE_ANNOTATIONS)
        {
            continue;
        }
        for type_index in annotation_type_indexes(&attribute.info)? {
            markers.record(pool.utf8_bytes(type_index)?);
        }
    }
    Ok(markers)
}

fn method_model(class: &ClassFile, method: &MemberInfo) -> Result<MethodModel> {
    let name = class.member_name(method)?;
    let descriptor = class.member_descriptor(method)?;
    let shape = method_shape(&descriptor, method.is_static())?;
    let return_markers = element_markers(class, &method.attributes)
        .with_context(|| format!("read annotations of {name}{descriptor}"))?;

    let mut parameters: Vec<ParameterModel> = shape
        .parameters
        .iter()
        .enumerate()
        .map(|(index, parameter)| ParameterModel {
            index,
            slot: parameter.slot,
            is_object: parameter.is_object,
            markers: Markers::default(),
        })
        .collect();

    let pool = &class.constant_pool;
    for attribute in &method.attributes {
        if !pool.utf8_eq(attribute.name_index, RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS)
            && !pool.utf8_eq(attribute.name_index, RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS)
        {
            continue;
        }
        let annotated = parameter_annotation_type_indexes(&attribute.info)
            .with_context(|| format!("read parameter annotations of {name}{descriptor}"))?;
        // Synthetic leading parameters (outer instance, enum name and ordinal)
        // are not listed, so the table lines up with the end of the descriptor.
        let shift = parameters
            .len()
            .checked_sub(annotated.len())
            .with_context(|| {
                format!("{name}{descriptor} has more annotated parameters than parameters")
            })?;
        for (position, type_indexes) in annotated.iter().enumerate() {
            let parameter = &mut parameters[position + shift];
            for type_index in type_indexes {
                parameter.markers.record(pool.utf8_bytes(*type_index)?);
            }
        }
    }

    Ok(MethodModel {
        has_code: class.find_attribute(&method.attributes, CODE).is_some(),
        name,
        descriptor,
        parameters,
        return_kind: shape.return_kind,
        return_markers,
    })
}

fn warn_conflict(class_name: &str, element: &str, markers: Markers) {
    if markers.is_conflicting() {
        warn!(
            class = class_name,
            element, "both @NotNull and @Nullable are present; treating as @NotNull"
        );
    }
}
