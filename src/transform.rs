//! Instruction stream transformer: inserts the null checks chosen by the
//! resolved policy and synthesizes the field initialization checks.

use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::checks::{CheckKind, HELPER_CLASS};
use crate::classfile::code::{CODE, CodeAttribute, Instruction, InstructionStream};
use crate::classfile::constant_pool::ConstantPool;
use crate::classfile::{ACC_PRIVATE, ACC_STATIC, ACC_SYNTHETIC, ClassFile};
use crate::descriptor::ReturnKind;
use crate::ir::{ClassModel, FieldKey, FieldModel, MethodModel};
use crate::opcodes;
use crate::policy::ResolvedPolicy;

/// Zero-length class attribute marking woven output.
pub(crate) const WOVEN_ATTRIBUTE: &str = "NotNullCheckWoven";
/// Extra operand stack any inserted sequence may need.
pub(crate) const EXTRA_STACK: u16 = 2;
pub(crate) const INSTANCE_CHECK_METHOD: &str = "$checkNotNullInstanceFieldsInitialized";
pub(crate) const STATIC_CHECK_METHOD: &str = "$checkNotNullStaticFieldsInitialized";

/// Counts of inserted guards for one class.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct WeaveStats {
    pub(crate) arguments: usize,
    pub(crate) results: usize,
    pub(crate) field_reads: usize,
    pub(crate) field_writes: usize,
    pub(crate) constructor_exits: usize,
    pub(crate) static_initializer_exits: usize,
    pub(crate) rewritten_methods: usize,
    pub(crate) synthesized_methods: usize,
}

impl WeaveStats {
    fn record(&mut self, kind: CheckKind) {
        match kind {
            CheckKind::Argument => self.arguments += 1,
            CheckKind::Result => self.results += 1,
            CheckKind::PutField => self.field_writes += 1,
            CheckKind::GetField => self.field_reads += 1,
            CheckKind::ConstructorField => self.constructor_exits += 1,
            CheckKind::StaticInitializerField => self.static_initializer_exits += 1,
        }
    }

    pub(crate) fn guards(&self) -> usize {
        self.arguments
            + self.results
            + self.field_reads
            + self.field_writes
            + self.constructor_exits
            + self.static_initializer_exits
    }

    pub(crate) fn add(&mut self, other: &WeaveStats) {
        self.arguments += other.arguments;
        self.results += other.results;
        self.field_reads += other.field_reads;
        self.field_writes += other.field_writes;
        self.constructor_exits += other.constructor_exits;
        self.static_initializer_exits += other.static_initializer_exits;
        self.rewritten_methods += other.rewritten_methods;
        self.synthesized_methods += other.synthesized_methods;
    }
}

/// A broken internal assumption of the weaver; never caused by input bytes.
#[derive(Debug)]
pub(crate) struct InvariantViolation(pub(crate) String);

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "weaver invariant violated: {}", self.0)
    }
}

impl std::error::Error for InvariantViolation {}

pub(crate) fn has_woven_marker(class: &ClassFile) -> bool {
    class.find_attribute(&class.attributes, WOVEN_ATTRIBUTE).is_some()
}

/// Weave `class` in place. Returns `None` when nothing needs a guard, in
/// which case `class` is left untouched.
pub(crate) fn weave_class(
    class: &mut ClassFile,
    model: &ClassModel,
    policy: &ResolvedPolicy,
) -> Result<Option<WeaveStats>> {
    check_alignment(class, model, policy)?;

    let guarded = GuardedFields::inspect(model, policy);
    let mut stats = WeaveStats::default();
    let mut rewritten = Vec::new();

    for (index, method) in model.methods.iter().enumerate() {
        if !method.has_code {
            continue;
        }
        let plan = MethodPlan {
            class_name: &model.name,
            is_interface: model.is_interface,
            method,
            parameters: &policy.methods[index].parameters,
            returns: policy.methods[index].returns,
            guarded: &guarded,
        };
        if let Some(code) = plan
            .rewrite(class, index, &mut stats)
            .with_context(|| format!("weave {}.{}{}", model.name, method.name, method.descriptor))?
        {
            rewritten.push((index, code));
        }
    }

    if rewritten.is_empty() && guarded.is_empty() {
        return Ok(None);
    }

    for (index, info) in rewritten {
        let method = &mut class.methods[index];
        let attribute = method
            .attributes
            .iter_mut()
            .find(|attribute| class.constant_pool.utf8_eq(attribute.name_index, CODE))
            .ok_or_else(|| InvariantViolation(format!("method {index} lost its Code attribute")))?;
        attribute.info = info;
        stats.rewritten_methods += 1;
    }

    if !guarded.instance.is_empty() {
        synthesize_instance_check(class, &model.name, &guarded.instance)?;
        stats.synthesized_methods += 1;
    }
    if !guarded.statics.is_empty() && !model.is_interface {
        synthesize_static_check(class, &model.name, &guarded.statics)?;
        stats.synthesized_methods += 1;
    }

    class.add_attribute(WOVEN_ATTRIBUTE, Vec::new())?;
    debug!(class = model.name.as_str(), guards = stats.guards(), "woven");
    Ok(Some(stats))
}

fn check_alignment(class: &ClassFile, model: &ClassModel, policy: &ResolvedPolicy) -> Result<()> {
    if model.fields.len() != class.fields.len()
        || model.methods.len() != class.methods.len()
        || policy.fields.len() != model.fields.len()
        || policy.methods.len() != model.methods.len()
    {
        return Err(InvariantViolation(format!(
            "model of {} does not match its class file",
            model.name
        ))
        .into());
    }
    for (method, resolved) in model.methods.iter().zip(&policy.methods) {
        if method.parameters.len() != resolved.parameters.len() {
            return Err(InvariantViolation(format!(
                "parameter verdicts of {}.{} do not match its descriptor",
                model.name, method.name
            ))
            .into());
        }
    }
    Ok(())
}

/// Reference-typed fields whose verdict is true, in declaration order.
struct GuardedFields<'a> {
    instance: Vec<&'a FieldKey>,
    statics: Vec<&'a FieldKey>,
    instance_keys: HashSet<&'a FieldKey>,
    static_keys: HashSet<&'a FieldKey>,
}

impl<'a> GuardedFields<'a> {
    fn inspect(model: &'a ClassModel, policy: &ResolvedPolicy) -> Self {
        let guarded: Vec<&'a FieldModel> = model
            .fields
            .iter()
            .zip(&policy.fields)
            .filter(|(field, verdict)| **verdict && field.is_object)
            .map(|(field, _)| field)
            .collect();
        let instance: Vec<&FieldKey> = guarded
            .iter()
            .copied()
            .filter(|field| !field.is_static)
            .map(|field| &field.key)
            .collect();
        let statics: Vec<&FieldKey> = guarded
            .iter()
            .copied()
            .filter(|field| field.is_static)
            .map(|field| &field.key)
            .collect();
        Self {
            instance_keys: instance.iter().copied().collect(),
            static_keys: statics.iter().copied().collect(),
            instance,
            statics,
        }
    }

    fn is_empty(&self) -> bool {
        self.instance.is_empty() && self.statics.is_empty()
    }

    fn matches(&self, opcode: u8, key: &FieldKey) -> bool {
        match opcode {
            opcodes::GETFIELD | opcodes::PUTFIELD => self.instance_keys.contains(key),
            opcodes::GETSTATIC | opcodes::PUTSTATIC => self.static_keys.contains(key),
            _ => false,
        }
    }
}

enum Placement {
    Before(usize),
    After(usize),
}

struct MethodPlan<'a> {
    class_name: &'a str,
    is_interface: bool,
    method: &'a MethodModel,
    parameters: &'a [bool],
    returns: bool,
    guarded: &'a GuardedFields<'a>,
}

impl MethodPlan<'_> {
    /// Returns the new Code attribute payload when anything was inserted.
    fn rewrite(
        &self,
        class: &mut ClassFile,
        method_index: usize,
        stats: &mut WeaveStats,
    ) -> Result<Option<Vec<u8>>> {
        let method_info = &class.methods[method_index];
        let code_info = class
            .find_attribute(&method_info.attributes, CODE)
            .ok_or_else(|| {
                InvariantViolation(format!(
                    "{}.{} has no Code attribute",
                    self.class_name, self.method.name
                ))
            })?
            .info
            .clone();
        let mut code = CodeAttribute::parse(&code_info)?;
        let mut stream = InstructionStream::decode(&code.code)?;
        let mut local = WeaveStats::default();
        let pool = &mut class.constant_pool;

        let mut entry = Vec::new();
        for (parameter, verdict) in self.method.parameters.iter().zip(self.parameters) {
            if !*verdict || !parameter.is_object {
                continue;
            }
            let index = u16::try_from(parameter.index).context("too many parameters")?;
            entry.push(Instruction::aload(parameter.slot));
            entry.push(Instruction::push_int(index));
            entry.push(check_call(pool, CheckKind::Argument)?);
            local.record(CheckKind::Argument);
        }
        stream.insert_at_entry(entry);

        let mut insertions: Vec<(Placement, Vec<Instruction>)> = Vec::new();
        let mut field_refs: HashMap<u16, bool> = HashMap::new();
        for (index, instruction) in stream.instructions() {
            match instruction.opcode {
                opcodes::ARETURN
                    if self.returns && self.method.return_kind == ReturnKind::Reference =>
                {
                    insertions.push((
                        Placement::Before(index),
                        vec![
                            Instruction::simple(opcodes::DUP),
                            check_call(pool, CheckKind::Result)?,
                        ],
                    ));
                    local.record(CheckKind::Result);
                }
                opcode @ (opcodes::GETFIELD | opcodes::GETSTATIC) => {
                    if self.is_guarded_access(pool, &mut field_refs, opcode, instruction.pool_index())? {
                        insertions.push((
                            Placement::After(index),
                            vec![
                                Instruction::simple(opcodes::DUP),
                                check_call(pool, CheckKind::GetField)?,
                            ],
                        ));
                        local.record(CheckKind::GetField);
                    }
                }
                opcode @ (opcodes::PUTFIELD | opcodes::PUTSTATIC) => {
                    if self.is_guarded_access(pool, &mut field_refs, opcode, instruction.pool_index())? {
                        insertions.push((
                            Placement::Before(index),
                            vec![
                                Instruction::simple(opcodes::DUP),
                                check_call(pool, CheckKind::PutField)?,
                            ],
                        ));
                        local.record(CheckKind::PutField);
                    }
                }
                opcodes::RETURN
                    if self.method.is_constructor() && !self.guarded.instance.is_empty() =>
                {
                    let check =
                        pool.add_method_ref(self.class_name, INSTANCE_CHECK_METHOD, "()V")?;
                    insertions.push((
                        Placement::Before(index),
                        vec![
                            Instruction::simple(opcodes::ALOAD_0),
                            Instruction::with_u16(opcodes::INVOKESPECIAL, check),
                        ],
                    ));
                    local.record(CheckKind::ConstructorField);
                }
                opcodes::RETURN
                    if self.method.is_static_initializer() && !self.guarded.statics.is_empty() =>
                {
                    let group = static_field_checks(
                        pool,
                        self.class_name,
                        self.is_interface,
                        &self.guarded.statics,
                    )?;
                    insertions.push((Placement::Before(index), group));
                    local.record(CheckKind::StaticInitializerField);
                }
                _ => {}
            }
        }

        for (placement, group) in insertions {
            match placement {
                Placement::Before(index) => stream.insert_before(index, group)?,
                Placement::After(index) => stream.insert_after(index, group)?,
            }
        }

        if !stream.is_modified() {
            return Ok(None);
        }
        code.apply(&stream, &class.constant_pool, EXTRA_STACK)?;
        stats.add(&local);
        Ok(Some(code.to_bytes()?))
    }

    fn is_guarded_access(
        &self,
        pool: &ConstantPool,
        cache: &mut HashMap<u16, bool>,
        opcode: u8,
        index: Option<u16>,
    ) -> Result<bool> {
        let index = index.context("field instruction without a constant pool index")?;
        if let Some(guarded) = cache.get(&index) {
            return Ok(*guarded);
        }
        let member = pool.member_ref(index)?;
        let guarded = member.owner == self.class_name
            && self.guarded.matches(
                opcode,
                &FieldKey {
                    name: member.name,
                    descriptor: member.descriptor,
                },
            );
        cache.insert(index, guarded);
        Ok(guarded)
    }
}

fn check_call(pool: &mut ConstantPool, kind: CheckKind) -> Result<Instruction> {
    let method = pool.add_method_ref(HELPER_CLASS, kind.method_name(), kind.method_descriptor())?;
    Ok(Instruction::with_u16(opcodes::INVOKESTATIC, method))
}

/// Checks run at the end of a static initializer: a call to the synthesized
/// method, or the checks themselves in an interface.
fn static_field_checks(
    pool: &mut ConstantPool,
    class_name: &str,
    is_interface: bool,
    fields: &[&FieldKey],
) -> Result<Vec<Instruction>> {
    if !is_interface {
        let check = pool.add_method_ref(class_name, STATIC_CHECK_METHOD, "()V")?;
        return Ok(vec![Instruction::with_u16(opcodes::INVOKESTATIC, check)]);
    }
    let mut group = Vec::with_capacity(fields.len() * 3);
    for field in fields {
        group.extend(field_check(
            pool,
            class_name,
            field,
            CheckKind::StaticInitializerField,
        )?);
    }
    Ok(group)
}

/// Read `field` and hand it to the initialization check with its name.
fn field_check(
    pool: &mut ConstantPool,
    class_name: &str,
    field: &FieldKey,
    kind: CheckKind,
) -> Result<Vec<Instruction>> {
    let reference = pool.add_field_ref(class_name, &field.name, &field.descriptor)?;
    let name = pool.add_string(&field.name)?;
    let mut group = Vec::with_capacity(4);
    if kind == CheckKind::ConstructorField {
        group.push(Instruction::simple(opcodes::ALOAD_0));
        group.push(Instruction::with_u16(opcodes::GETFIELD, reference));
    } else {
        group.push(Instruction::with_u16(opcodes::GETSTATIC, reference));
    }
    group.push(Instruction::ldc(name));
    group.push(check_call(pool, kind)?);
    Ok(group)
}

fn ensure_absent(class: &ClassFile, name: &str) -> Result<()> {
    if class.has_method(name) {
        anyhow::bail!("{} already declares {}", class.name()?, name);
    }
    Ok(())
}

fn synthesize_instance_check(
    class: &mut ClassFile,
    class_name: &str,
    fields: &[&FieldKey],
) -> Result<()> {
    ensure_absent(class, INSTANCE_CHECK_METHOD)?;
    let mut body = Vec::new();
    for field in fields {
        body.extend(field_check(
            &mut class.constant_pool,
            class_name,
            field,
            CheckKind::ConstructorField,
        )?);
    }
    body.push(Instruction::simple(opcodes::RETURN));
    let code = generated_code(body, 1)?;
    class.add_method(
        ACC_PRIVATE | ACC_SYNTHETIC,
        INSTANCE_CHECK_METHOD,
        "()V",
        Some(code),
    )
}

fn synthesize_static_check(
    class: &mut ClassFile,
    class_name: &str,
    fields: &[&FieldKey],
) -> Result<()> {
    ensure_absent(class, STATIC_CHECK_METHOD)?;
    let mut body = Vec::new();
    for field in fields {
        body.extend(field_check(
            &mut class.constant_pool,
            class_name,
            field,
            CheckKind::StaticInitializerField,
        )?);
    }
    body.push(Instruction::simple(opcodes::RETURN));
    let code = generated_code(body, 0)?;
    class.add_method(
        ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
        STATIC_CHECK_METHOD,
        "()V",
        Some(code),
    )
}

fn generated_code(body: Vec<Instruction>, max_locals: u16) -> Result<Vec<u8>> {
    let stream = InstructionStream::from_instructions(body);
    CodeAttribute::generate(&stream, EXTRA_STACK, max_locals)?.to_bytes()
}
