//! Class files for the runtime side of the checks: the two annotations, the
//! exception hierarchy and `NotNullHelper`.
//!
//! Classes are emitted at version 49 so no stack map frames are required.

use anyhow::{Context, Result};

use crate::checks::{BASE_EXCEPTION_CLASS, CheckDetail, CheckKind, HELPER_CLASS};
use crate::classfile::annotations::RUNTIME_VISIBLE_ANNOTATIONS;
use crate::classfile::bytes::ByteSink;
use crate::classfile::code::{CodeAttribute, Instruction, InstructionStream, Label};
use crate::classfile::{
    ACC_ABSTRACT, ACC_ANNOTATION, ACC_FINAL, ACC_INTERFACE, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC,
    ACC_SUPER, ClassFile,
};
use crate::opcodes;

const RUNTIME_CLASS_VERSION: u16 = 49;
const OBJECT: &str = "java/lang/Object";
const STRING_BUILDER: &str = "java/lang/StringBuilder";
const ANNOTATION_TYPES: [&str; 2] = ["notnullcheckweaver/NotNull", "notnullcheckweaver/Nullable"];
const ELEMENT_TYPES: [&str; 5] = ["PACKAGE", "TYPE", "FIELD", "PARAMETER", "METHOD"];

/// One generated runtime class.
#[derive(Clone, Debug)]
pub(crate) struct RuntimeClass {
    pub(crate) name: String,
    pub(crate) bytes: Vec<u8>,
}

/// Generate every runtime class.
pub(crate) fn runtime_classes() -> Result<Vec<RuntimeClass>> {
    let mut classes = Vec::new();
    for name in ANNOTATION_TYPES {
        classes.push(finish(annotation_type(name)?)?);
    }
    classes.push(finish(base_exception()?)?);
    for kind in CheckKind::ALL {
        classes.push(finish(exception(kind).with_context(|| {
            format!("generate {}", kind.exception_class())
        })?)?);
    }
    classes.push(finish(helper()?)?);
    Ok(classes)
}

fn finish(class: ClassFile) -> Result<RuntimeClass> {
    Ok(RuntimeClass {
        name: class.name()?,
        bytes: class.to_bytes()?,
    })
}

fn annotation_type(name: &str) -> Result<ClassFile> {
    let mut class = ClassFile::new(
        name,
        OBJECT,
        ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT | ACC_ANNOTATION,
        RUNTIME_CLASS_VERSION,
    )?;
    class.add_interface("java/lang/annotation/Annotation")?;

    let pool = &mut class.constant_pool;
    let value = pool.add_utf8("value")?;
    let mut info = Vec::new();
    info.put_u16(3);

    info.put_u16(pool.add_utf8("Ljava/lang/annotation/Documented;")?);
    info.put_u16(0);

    info.put_u16(pool.add_utf8("Ljava/lang/annotation/Retention;")?);
    info.put_u16(1);
    info.put_u16(value);
    info.put_u8(b'e');
    info.put_u16(pool.add_utf8("Ljava/lang/annotation/RetentionPolicy;")?);
    info.put_u16(pool.add_utf8("RUNTIME")?);

    info.put_u16(pool.add_utf8("Ljava/lang/annotation/Target;")?);
    info.put_u16(1);
    info.put_u16(value);
    info.put_u8(b'[');
    info.put_u16(ELEMENT_TYPES.len() as u16);
    let element_type = pool.add_utf8("Ljava/lang/annotation/ElementType;")?;
    for constant in ELEMENT_TYPES {
        info.put_u8(b'e');
        info.put_u16(element_type);
        info.put_u16(pool.add_utf8(constant)?);
    }

    class.add_attribute(RUNTIME_VISIBLE_ANNOTATIONS, info)?;
    Ok(class)
}

fn base_exception() -> Result<ClassFile> {
    let mut class = ClassFile::new(
        BASE_EXCEPTION_CLASS,
        "java/lang/RuntimeException",
        ACC_PUBLIC | ACC_SUPER | ACC_ABSTRACT,
        RUNTIME_CLASS_VERSION,
    )?;
    let super_init = class.constant_pool.add_method_ref(
        "java/lang/RuntimeException",
        "<init>",
        "(Ljava/lang/String;)V",
    )?;
    let code = generate(
        vec![
            Instruction::simple(opcodes::ALOAD_0),
            Instruction::simple(opcodes::ALOAD_1),
            Instruction::with_u16(opcodes::INVOKESPECIAL, super_init),
            Instruction::simple(opcodes::RETURN),
        ],
        2,
        2,
    )?;
    class.add_method(ACC_PUBLIC, "<init>", "(Ljava/lang/String;)V", Some(code))?;
    Ok(class)
}

fn exception(kind: CheckKind) -> Result<ClassFile> {
    let name = kind.exception_class();
    let mut class = ClassFile::new(
        name,
        BASE_EXCEPTION_CLASS,
        ACC_PUBLIC | ACC_SUPER,
        RUNTIME_CLASS_VERSION,
    )?;
    let super_init =
        class
            .constant_pool
            .add_method_ref(BASE_EXCEPTION_CLASS, "<init>", "(Ljava/lang/String;)V")?;
    let (prefix, suffix) = kind.message_parts();
    let constructor_descriptor = kind.exception_constructor_descriptor();

    let (field_name, field_descriptor, getter, load, ret) = match kind.detail() {
        CheckDetail::None => {
            let message = class.constant_pool.add_string(prefix)?;
            let code = generate(
                vec![
                    Instruction::simple(opcodes::ALOAD_0),
                    Instruction::ldc(message),
                    Instruction::with_u16(opcodes::INVOKESPECIAL, super_init),
                    Instruction::simple(opcodes::RETURN),
                ],
                2,
                1,
            )?;
            class.add_method(ACC_PUBLIC, "<init>", constructor_descriptor, Some(code))?;
            return Ok(class);
        }
        CheckDetail::ArgumentIndex => (
            "index",
            "I",
            "getArgumentIndex",
            opcodes::ILOAD_1,
            opcodes::IRETURN,
        ),
        CheckDetail::FieldName => (
            "fieldName",
            "Ljava/lang/String;",
            "getFieldName",
            opcodes::ALOAD_1,
            opcodes::ARETURN,
        ),
    };

    class.add_field(ACC_PRIVATE | ACC_FINAL, field_name, field_descriptor)?;
    let pool = &mut class.constant_pool;
    let field = pool.add_field_ref(name, field_name, field_descriptor)?;
    let builder = pool.add_class(STRING_BUILDER)?;
    let builder_init = pool.add_method_ref(STRING_BUILDER, "<init>", "(Ljava/lang/String;)V")?;
    let append_detail = pool.add_method_ref(
        STRING_BUILDER,
        "append",
        &format!("({field_descriptor})Ljava/lang/StringBuilder;"),
    )?;
    let append_string = pool.add_method_ref(
        STRING_BUILDER,
        "append",
        "(Ljava/lang/String;)Ljava/lang/StringBuilder;",
    )?;
    let to_string = pool.add_method_ref(STRING_BUILDER, "toString", "()Ljava/lang/String;")?;
    let prefix = pool.add_string(prefix)?;
    let suffix = pool.add_string(suffix)?;

    let mut instructions = vec![
        Instruction::simple(opcodes::ALOAD_0),
        Instruction::with_u16(opcodes::NEW, builder),
        Instruction::simple(opcodes::DUP),
        Instruction::ldc(prefix),
        Instruction::with_u16(opcodes::INVOKESPECIAL, builder_init),
        Instruction::simple(load),
        Instruction::with_u16(opcodes::INVOKEVIRTUAL, append_detail),
        Instruction::ldc(suffix),
        Instruction::with_u16(opcodes::INVOKEVIRTUAL, append_string),
        Instruction::with_u16(opcodes::INVOKEVIRTUAL, to_string),
        Instruction::with_u16(opcodes::INVOKESPECIAL, super_init),
    ];
    instructions.extend([
        Instruction::simple(opcodes::ALOAD_0),
        Instruction::simple(load),
        Instruction::with_u16(opcodes::PUTFIELD, field),
        Instruction::simple(opcodes::RETURN),
    ]);
    let constructor = generate(instructions, 4, 2)?;
    class.add_method(ACC_PUBLIC, "<init>", constructor_descriptor, Some(constructor))?;

    let accessor = generate(
        vec![
            Instruction::simple(opcodes::ALOAD_0),
            Instruction::with_u16(opcodes::GETFIELD, field),
            Instruction::simple(ret),
        ],
        1,
        1,
    )?;
    class.add_method(
        ACC_PUBLIC,
        getter,
        &format!("(){field_descriptor}"),
        Some(accessor),
    )?;
    Ok(class)
}

fn helper() -> Result<ClassFile> {
    let mut class = ClassFile::new(
        HELPER_CLASS,
        OBJECT,
        ACC_PUBLIC | ACC_FINAL | ACC_SUPER,
        RUNTIME_CLASS_VERSION,
    )?;
    let object_init = class
        .constant_pool
        .add_method_ref(OBJECT, "<init>", "()V")?;
    let constructor = generate(
        vec![
            Instruction::simple(opcodes::ALOAD_0),
            Instruction::with_u16(opcodes::INVOKESPECIAL, object_init),
            Instruction::simple(opcodes::RETURN),
        ],
        1,
        1,
    )?;
    class.add_method(ACC_PRIVATE, "<init>", "()V", Some(constructor))?;

    for kind in CheckKind::ALL {
        let exception = kind.exception_class();
        let pool = &mut class.constant_pool;
        let exception_class = pool.add_class(exception)?;
        let exception_init =
            pool.add_method_ref(exception, "<init>", kind.exception_constructor_descriptor())?;

        let detail = match kind.detail() {
            CheckDetail::None => None,
            CheckDetail::ArgumentIndex => Some(opcodes::ILOAD_1),
            CheckDetail::FieldName => Some(opcodes::ALOAD_1),
        };
        let mut instructions = vec![
            Instruction::simple(opcodes::ALOAD_0),
            // patched below once the position of the return is known
            Instruction::branch(opcodes::IFNONNULL, Label(0)),
            Instruction::with_u16(opcodes::NEW, exception_class),
            Instruction::simple(opcodes::DUP),
        ];
        instructions.extend(detail.map(Instruction::simple));
        instructions.push(Instruction::with_u16(opcodes::INVOKESPECIAL, exception_init));
        instructions.push(Instruction::simple(opcodes::ATHROW));
        let exit = instructions.len();
        instructions.push(Instruction::simple(opcodes::RETURN));
        instructions[1] = Instruction::branch(opcodes::IFNONNULL, Label(exit));

        let (max_stack, max_locals) = if detail.is_some() { (3, 2) } else { (2, 1) };
        let code = generate(instructions, max_stack, max_locals)?;
        class.add_method(
            ACC_PUBLIC | ACC_STATIC,
            kind.method_name(),
            kind.method_descriptor(),
            Some(code),
        )?;
    }
    Ok(class)
}

fn generate(instructions: Vec<Instruction>, max_stack: u16, max_locals: u16) -> Result<Vec<u8>> {
    let stream = InstructionStream::from_instructions(instructions);
    CodeAttribute::generate(&stream, max_stack, max_locals)?.to_bytes()
}
