use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::classpath::resolve_classpath;
use crate::engine::{Engine, EngineOutput};
use crate::output::{RuntimeMode, write_output};
use crate::runtime::runtime_classes;
use crate::scan::scan_inputs;

/// Source file definition for compilation.
pub(crate) struct SourceFile {
    pub(crate) path: String,
    pub(crate) contents: String,
}

/// Compiled output directories from the harness.
pub(crate) struct CompileOutput {
    #[allow(dead_code)]
    temp_dir: TempDir,
    classes_dir: PathBuf,
}

impl CompileOutput {
    pub(crate) fn classes_dir(&self) -> &Path {
        &self.classes_dir
    }
}

/// Woven classes together with the emitted check runtime.
pub(crate) struct WeaveOutput {
    #[allow(dead_code)]
    temp_dir: TempDir,
    output_dir: PathBuf,
    pub(crate) engine: EngineOutput,
}

impl WeaveOutput {
    pub(crate) fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// Result of running a woven program.
pub(crate) struct JavaRun {
    pub(crate) success: bool,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

/// Test harness that compiles Java sources, weaves them and runs them.
pub(crate) struct JvmTestHarness {
    javac: PathBuf,
    java: PathBuf,
    runtime_dir: TempDir,
}

impl JvmTestHarness {
    pub(crate) fn new() -> Result<Self> {
        let javac = jdk_tool("javac")?;
        let java = jdk_tool("java")?;
        let runtime_dir = tempfile::tempdir().context("create runtime dir")?;
        for class in runtime_classes()? {
            let path = runtime_dir.path().join(format!("{}.class", class.name));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("create runtime package dir")?;
            }
            fs::write(&path, &class.bytes).context("write runtime class")?;
        }
        Ok(Self {
            javac,
            java,
            runtime_dir,
        })
    }

    /// Compile sources against the check runtime annotations.
    pub(crate) fn compile(&self, sources: &[SourceFile]) -> Result<CompileOutput> {
        let temp_dir = tempfile::tempdir().context("create temp dir")?;
        let src_dir = temp_dir.path().join("src");
        let classes_dir = temp_dir.path().join("classes");
        fs::create_dir_all(&src_dir).context("create src dir")?;
        fs::create_dir_all(&classes_dir).context("create classes dir")?;

        let mut source_paths = Vec::new();
        for source in sources {
            let path = src_dir.join(&source.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("create source parent dir")?;
            }
            fs::write(&path, source.contents.as_bytes()).context("write source file")?;
            source_paths.push(path);
        }

        let mut command = Command::new(&self.javac);
        command.arg("-d").arg(&classes_dir);
        if let Some(cp) = classpath_arg(&[self.runtime_dir.path().to_path_buf()]) {
            command.arg("-classpath").arg(cp);
        }
        command.args(&source_paths);
        run_command(command, "javac")?;

        Ok(CompileOutput {
            temp_dir,
            classes_dir,
        })
    }

    /// Weave a classes directory into a fresh output directory with the runtime emitted.
    pub(crate) fn weave(&self, classes_dir: &Path, root_package: &str) -> Result<WeaveOutput> {
        let temp_dir = tempfile::tempdir().context("create output temp dir")?;
        let output_dir = temp_dir.path().join("woven");
        let scan = scan_inputs(classes_dir, &[], None).context("scan classes")?;
        let classpath = resolve_classpath(&scan).context("resolve classpath")?;
        let engine = Engine::new(root_package)?;
        let woven = engine.weave(&scan.entries, &classpath, None)?;
        write_output(&scan, &woven, RuntimeMode::Emit, &output_dir, None)
            .context("write woven classes")?;
        Ok(WeaveOutput {
            temp_dir,
            output_dir,
            engine: woven,
        })
    }

    pub(crate) fn run(&self, classpath: &Path, main_class: &str) -> Result<JavaRun> {
        let output = Command::new(&self.java)
            .arg("-classpath")
            .arg(classpath)
            .arg(main_class)
            .output()
            .context("run java")?;
        Ok(JavaRun {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    pub(crate) fn compile_weave_and_run(
        &self,
        sources: &[SourceFile],
        root_package: &str,
        main_class: &str,
    ) -> Result<JavaRun> {
        let compiled = self.compile(sources)?;
        let woven = self.weave(compiled.classes_dir(), root_package)?;
        self.run(woven.output_dir(), main_class)
    }
}

/// Harness for end-to-end tests, or `None` when no JDK is configured.
pub(crate) fn jvm_harness() -> Option<JvmTestHarness> {
    match JvmTestHarness::new() {
        Ok(harness) => Some(harness),
        Err(error) => {
            eprintln!("skipping JDK scenario: {error:#}");
            None
        }
    }
}

fn jdk_tool(name: &str) -> Result<PathBuf> {
    let java_home = std::env::var("JAVA_HOME").context("JAVA_HOME not set")?;
    let mut path = PathBuf::from(java_home);
    path.push("bin");
    path.push(name);
    if cfg!(windows) {
        path.set_extension("exe");
    }
    if !path.exists() {
        anyhow::bail!("{name} not found at {}", path.display());
    }
    Ok(path)
}

fn classpath_arg(paths: &[PathBuf]) -> Option<String> {
    if paths.is_empty() {
        return None;
    }
    let sep = if cfg!(windows) { ";" } else { ":" };
    let joined = paths
        .iter()
        .map(|path| path.to_string_lossy())
        .collect::<Vec<_>>()
        .join(sep);
    Some(joined)
}

fn run_command(mut command: Command, label: &str) -> Result<()> {
    let output = command.output().with_context(|| format!("run {label}"))?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{label} failed: stdout={stdout} stderr={stderr}");
    }
    Ok(())
}

/// Minimal class file writer for unit test fixtures.
///
/// Entries are appended without interning, and member-level calls such as
/// [`ClassFileBuilder::annotate_method`] apply to the member added last.
pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    access: u16,
    this_class: u16,
    super_class: u16,
    fields: Vec<MemberSpec>,
    methods: Vec<MemberSpec>,
    annotations: Vec<(u16, bool)>,
    attributes: Vec<(u16, Vec<u8>)>,
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str, super_name: &str) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            access: 0x0021,
            this_class: 0,
            super_class: 0,
            fields: Vec::new(),
            methods: Vec::new(),
            annotations: Vec::new(),
            attributes: Vec::new(),
        };
        builder.this_class = builder.add_class(class_name);
        builder.super_class = builder.add_class(super_name);
        builder
    }

    pub(crate) fn set_access(&mut self, access: u16) {
        self.access = access;
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> u16 {
        self.cp.push(CpEntry::Utf8(value.to_string()));
        self.cp.len() as u16
    }

    pub(crate) fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.cp.push(CpEntry::Class(name_index));
        self.cp.len() as u16
    }

    fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.cp
            .push(CpEntry::NameAndType(name_index, descriptor_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.cp.push(CpEntry::FieldRef(class_index, name_and_type));
        self.cp.len() as u16
    }

    pub(crate) fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.cp
            .push(CpEntry::MethodRef(class_index, name_and_type));
        self.cp.len() as u16
    }

    pub(crate) fn add_field(&mut self, access: u16, name: &str, descriptor: &str) {
        let member = self.member(access, name, descriptor, None);
        self.fields.push(member);
    }

    pub(crate) fn add_method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        max_stack: u16,
        max_locals: u16,
    ) {
        let code = CodeSpec {
            code,
            max_stack,
            max_locals,
            handlers: Vec::new(),
            attributes: Vec::new(),
        };
        let member = self.member(access, name, descriptor, Some(code));
        self.methods.push(member);
    }

    pub(crate) fn add_abstract_method(&mut self, access: u16, name: &str, descriptor: &str) {
        let member = self.member(access, name, descriptor, None);
        self.methods.push(member);
    }

    /// Exception table row for the last method.
    pub(crate) fn add_exception_handler(
        &mut self,
        start_pc: u16,
        end_pc: u16,
        handler_pc: u16,
        catch_type: u16,
    ) {
        self.last_code()
            .handlers
            .push([start_pc, end_pc, handler_pc, catch_type]);
    }

    /// Nested attribute of the last method's code.
    pub(crate) fn add_code_attribute(&mut self, name: &str, info: Vec<u8>) {
        let name_index = self.add_utf8(name);
        self.last_code().attributes.push((name_index, info));
    }

    pub(crate) fn add_class_attribute(&mut self, name: &str, info: Vec<u8>) {
        let name_index = self.add_utf8(name);
        self.attributes.push((name_index, info));
    }

    pub(crate) fn annotate_class(&mut self, descriptor: &str, visible: bool) {
        let type_index = self.add_utf8(descriptor);
        self.annotations.push((type_index, visible));
    }

    pub(crate) fn annotate_field(&mut self, descriptor: &str, visible: bool) {
        let type_index = self.add_utf8(descriptor);
        let field = self.fields.last_mut().expect("field added");
        field.annotations.push((type_index, visible));
    }

    pub(crate) fn annotate_method(&mut self, descriptor: &str, visible: bool) {
        let type_index = self.add_utf8(descriptor);
        let method = self.methods.last_mut().expect("method added");
        method.annotations.push((type_index, visible));
    }

    /// Parameter annotation table of the last method, one slice per listed parameter.
    pub(crate) fn annotate_parameters(&mut self, parameters: &[&[&str]], visible: bool) {
        let table: Vec<Vec<u16>> = parameters
            .iter()
            .map(|annotations| {
                annotations
                    .iter()
                    .map(|descriptor| self.add_utf8(descriptor))
                    .collect()
            })
            .collect();
        let method = self.methods.last_mut().expect("method added");
        method.parameter_annotations.push((visible, table));
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        let names = AttributeNames {
            code: self.add_utf8("Code"),
            visible: self.add_utf8("RuntimeVisibleAnnotations"),
            invisible: self.add_utf8("RuntimeInvisibleAnnotations"),
            visible_parameters: self.add_utf8("RuntimeVisibleParameterAnnotations"),
            invisible_parameters: self.add_utf8("RuntimeInvisibleParameterAnnotations"),
        };

        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 52);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, self.access);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, 0);
        for members in [&self.fields, &self.methods] {
            write_u16(&mut bytes, members.len() as u16);
            for member in members {
                member.write(&mut bytes, &names);
            }
        }

        let mut attributes = annotation_attributes(&self.annotations, &names);
        attributes.extend(self.attributes.iter().cloned());
        write_attributes(&mut bytes, &attributes);
        bytes
    }

    fn member(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        code: Option<CodeSpec>,
    ) -> MemberSpec {
        MemberSpec {
            access,
            name_index: self.add_utf8(name),
            descriptor_index: self.add_utf8(descriptor),
            code,
            annotations: Vec::new(),
            parameter_annotations: Vec::new(),
        }
    }

    fn last_code(&mut self) -> &mut CodeSpec {
        self.methods
            .last_mut()
            .and_then(|method| method.code.as_mut())
            .expect("method with code added")
    }
}

struct AttributeNames {
    code: u16,
    visible: u16,
    invisible: u16,
    visible_parameters: u16,
    invisible_parameters: u16,
}

/// Field or method definition for generated class files.
struct MemberSpec {
    access: u16,
    name_index: u16,
    descriptor_index: u16,
    code: Option<CodeSpec>,
    annotations: Vec<(u16, bool)>,
    parameter_annotations: Vec<(bool, Vec<Vec<u16>>)>,
}

impl MemberSpec {
    fn write(&self, bytes: &mut Vec<u8>, names: &AttributeNames) {
        write_u16(bytes, self.access);
        write_u16(bytes, self.name_index);
        write_u16(bytes, self.descriptor_index);

        let mut attributes = Vec::new();
        if let Some(code) = &self.code {
            attributes.push((names.code, code.to_bytes()));
        }
        attributes.extend(annotation_attributes(&self.annotations, names));
        for (visible, table) in &self.parameter_annotations {
            let name = if *visible {
                names.visible_parameters
            } else {
                names.invisible_parameters
            };
            let mut info = vec![table.len() as u8];
            for annotations in table {
                write_annotations(&mut info, annotations.iter().copied());
            }
            attributes.push((name, info));
        }
        write_attributes(bytes, &attributes);
    }
}

struct CodeSpec {
    code: Vec<u8>,
    max_stack: u16,
    max_locals: u16,
    handlers: Vec<[u16; 4]>,
    attributes: Vec<(u16, Vec<u8>)>,
}

impl CodeSpec {
    fn to_bytes(&self) -> Vec<u8> {
        let mut info = Vec::new();
        write_u16(&mut info, self.max_stack);
        write_u16(&mut info, self.max_locals);
        write_u32(&mut info, self.code.len() as u32);
        info.extend_from_slice(&self.code);
        write_u16(&mut info, self.handlers.len() as u16);
        for handler in &self.handlers {
            for value in handler {
                write_u16(&mut info, *value);
            }
        }
        write_attributes(&mut info, &self.attributes);
        info
    }
}

/// Constant pool entries needed by fixture class files.
enum CpEntry {
    Utf8(String),
    Class(u16),
    NameAndType(u16, u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
            CpEntry::NameAndType(name_index, descriptor_index) => {
                bytes.push(12);
                write_u16(bytes, *name_index);
                write_u16(bytes, *descriptor_index);
            }
            CpEntry::FieldRef(class_index, name_and_type) => {
                bytes.push(9);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
            CpEntry::MethodRef(class_index, name_and_type) => {
                bytes.push(10);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
        }
    }
}

fn annotation_attributes(annotations: &[(u16, bool)], names: &AttributeNames) -> Vec<(u16, Vec<u8>)> {
    let mut attributes = Vec::new();
    for (visible, name) in [(true, names.visible), (false, names.invisible)] {
        let selected: Vec<u16> = annotations
            .iter()
            .filter(|(_, is_visible)| *is_visible == visible)
            .map(|(type_index, _)| *type_index)
            .collect();
        if selected.is_empty() {
            continue;
        }
        let mut info = Vec::new();
        write_annotations(&mut info, selected.into_iter());
        attributes.push((name, info));
    }
    attributes
}

fn write_annotations(bytes: &mut Vec<u8>, type_indexes: impl ExactSizeIterator<Item = u16>) {
    write_u16(bytes, type_indexes.len() as u16);
    for type_index in type_indexes {
        write_u16(bytes, type_index);
        write_u16(bytes, 0);
    }
}

fn write_attributes(bytes: &mut Vec<u8>, attributes: &[(u16, Vec<u8>)]) {
    write_u16(bytes, attributes.len() as u16);
    for (name_index, info) in attributes {
        write_u16(bytes, *name_index);
        write_u32(bytes, info.len() as u32);
        bytes.extend_from_slice(info);
    }
}

fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}
