use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use tracing::debug;
use zip::ZipArchive;

use crate::classfile::peek_class_name;
use crate::telemetry::{Telemetry, with_span};

const CLASS_SUFFIX: &str = ".class";
const MODULE_INFO: &str = "module-info.class";
const VERSIONED_PREFIX: &str = "META-INF/versions/";

/// Shape of the input, mirrored by the output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InputLayout {
    Directory,
    Jar,
    ClassFile,
}

/// One file of the input, woven or copied through.
pub(crate) struct InputEntry {
    /// Path relative to the input root with `/` separators, or the jar entry name.
    pub(crate) path: String,
    /// Internal name the class is loaded under; `None` for entries copied as is.
    pub(crate) class_name: Option<String>,
    pub(crate) bytes: Vec<u8>,
}

/// Class available to lookups but never rewritten.
pub(crate) struct ClasspathClass {
    pub(crate) name: String,
    pub(crate) bytes: Vec<u8>,
    pub(crate) origin: PathBuf,
}

/// Snapshot of the input and the resolved classpath.
pub(crate) struct ScanOutput {
    pub(crate) layout: InputLayout,
    pub(crate) entries: Vec<InputEntry>,
    pub(crate) classpath_classes: Vec<ClasspathClass>,
    pub(crate) class_count: usize,
}

pub(crate) fn scan_inputs(
    input: &Path,
    classpath: &[PathBuf],
    telemetry: Option<&Telemetry>,
) -> Result<ScanOutput> {
    let (layout, entries) = scan_input(input, telemetry)?;
    let class_count = entries
        .iter()
        .filter(|entry| entry.class_name.is_some())
        .count();

    // Keep deterministic ordering by sorting classpath entries and directory listings.
    let mut classpath_entries = classpath.to_vec();
    classpath_entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    if layout == InputLayout::Jar {
        classpath_entries.extend(manifest_classpath(input)?);
    }

    let mut classpath_classes = Vec::new();
    let expanded = expand_classpath(classpath_entries)?;
    for entry in expanded {
        if entry == input {
            continue;
        }
        scan_classpath_entry(&entry, true, telemetry, &mut classpath_classes)?;
    }

    Ok(ScanOutput {
        layout,
        entries,
        classpath_classes,
        class_count,
    })
}

fn scan_input(
    input: &Path,
    telemetry: Option<&Telemetry>,
) -> Result<(InputLayout, Vec<InputEntry>)> {
    if input.is_dir() {
        let mut files = Vec::new();
        collect_files(input, &mut files)?;
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let path = relative_entry_path(input, &file)?;
            let bytes =
                fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            entries.push(InputEntry {
                class_name: weavable_class_name(&path),
                path,
                bytes,
            });
        }
        return Ok((InputLayout::Directory, entries));
    }

    if is_jar_path(input) {
        let jar_span_attributes = [KeyValue::new(
            "nullcheck_weaver.jar_path",
            input.display().to_string(),
        )];
        let entries = with_span(telemetry, "jar.scan", &jar_span_attributes, || {
            read_jar_entries(input)
        })?;
        return Ok((InputLayout::Jar, entries));
    }

    if is_class_path(input) {
        let bytes =
            fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
        let name = peek_class_name(&bytes)
            .with_context(|| format!("failed to parse {}", input.display()))?;
        let entry = InputEntry {
            path: format!("{name}{CLASS_SUFFIX}"),
            class_name: Some(name),
            bytes,
        };
        return Ok((InputLayout::ClassFile, vec![entry]));
    }

    anyhow::bail!("unsupported input file: {}", input.display())
}

/// Every file entry of the jar, in archive order.
fn read_jar_entries(path: &Path) -> Result<Vec<InputEntry>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        entries.push(InputEntry {
            class_name: weavable_class_name(&name),
            path: name,
            bytes,
        });
    }
    Ok(entries)
}

fn scan_classpath_entry(
    path: &Path,
    strict: bool,
    telemetry: Option<&Telemetry>,
    classes: &mut Vec<ClasspathClass>,
) -> Result<()> {
    if path.is_dir() {
        let mut files = Vec::new();
        collect_files(path, &mut files)?;
        for file in files {
            scan_classpath_entry(&file, false, telemetry, classes)?;
        }
        return Ok(());
    }

    if is_jar_path(path) {
        let jar_span_attributes = [KeyValue::new(
            "nullcheck_weaver.jar_path",
            path.display().to_string(),
        )];
        return with_span(telemetry, "jar.scan", &jar_span_attributes, || {
            scan_classpath_jar(path, classes)
        });
    }

    if is_class_path(path) {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        match peek_class_name(&bytes) {
            Ok(name) => classes.push(ClasspathClass {
                name,
                bytes,
                origin: path.to_path_buf(),
            }),
            Err(error) if !strict => {
                debug!(path = %path.display(), error = %error, "skipping unreadable class");
            }
            Err(error) => {
                return Err(error.context(format!("failed to parse {}", path.display())));
            }
        }
        return Ok(());
    }

    if strict {
        anyhow::bail!("unsupported classpath entry: {}", path.display())
    }
    Ok(())
}

fn scan_classpath_jar(path: &Path, classes: &mut Vec<ClasspathClass>) -> Result<()> {
    for entry in read_jar_entries(path)? {
        if entry.class_name.is_none() {
            continue;
        }
        match peek_class_name(&entry.bytes) {
            Ok(name) => classes.push(ClasspathClass {
                name,
                bytes: entry.bytes,
                origin: path.to_path_buf(),
            }),
            Err(error) => {
                debug!(
                    jar = %path.display(),
                    entry = entry.path.as_str(),
                    error = %error,
                    "skipping unreadable class"
                );
            }
        }
    }
    Ok(())
}

/// Files under `path`, depth first with sorted listings.
fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            collect_files(&entry, files)?;
        } else {
            files.push(entry);
        }
    }

    Ok(())
}

fn relative_entry_path(root: &Path, file: &Path) -> Result<String> {
    let relative = file
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", file.display(), root.display()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Class name for entries the dispatcher sees; module descriptors and
/// multi-release variants are copied through.
pub(crate) fn weavable_class_name(path: &str) -> Option<String> {
    // TODO: Weave multi-release entries under META-INF/versions/ against their base package.
    if path.starts_with(VERSIONED_PREFIX) {
        return None;
    }
    let name = path.strip_suffix(CLASS_SUFFIX)?;
    let file_name = path.rsplit('/').next().unwrap_or(path);
    if file_name == MODULE_INFO || name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn expand_classpath(initial: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut queue = VecDeque::new();
    let mut initial_sorted = initial;
    initial_sorted.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    for entry in initial_sorted {
        queue.push_back(entry);
    }

    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    while let Some(entry) = queue.pop_front() {
        let key = path_key(&entry);
        if !seen.insert(key) {
            continue;
        }
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
        result.push(entry.clone());
        if is_jar_path(&entry) {
            let mut referenced = manifest_classpath(&entry)?;
            referenced.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
            for item in referenced {
                queue.push_back(item);
            }
        }
    }

    Ok(result)
}

fn manifest_classpath(path: &Path) -> Result<Vec<PathBuf>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.name() != "META-INF/MANIFEST.MF" {
            continue;
        }
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .with_context(|| format!("failed to read {}", entry.name()))?;
        return Ok(parse_manifest_classpath(path, &content));
    }

    Ok(Vec::new())
}

fn parse_manifest_classpath(jar_path: &Path, content: &str) -> Vec<PathBuf> {
    let mut class_path = None;
    let mut current_key: Option<String> = None;
    let mut current_value = String::new();

    for raw_line in content.lines() {
        let line = raw_line.trim_end_matches('\r');
        if let Some(continuation) = line.strip_prefix(' ') {
            if current_key.is_some() {
                current_value.push_str(continuation);
            }
            continue;
        }

        if let Some(key) = current_key.take() {
            if key == "Class-Path" {
                class_path = Some(current_value.clone());
            }
            current_value.clear();
        }

        if let Some((key, value)) = line.split_once(':') {
            current_key = Some(key.trim().to_string());
            current_value.push_str(value.trim_start());
        }
    }

    if current_key.as_deref() == Some("Class-Path") {
        class_path = Some(current_value);
    }

    let Some(class_path) = class_path else {
        return Vec::new();
    };

    let base_dir = jar_path.parent().unwrap_or_else(|| Path::new(""));
    class_path
        .split_whitespace()
        .map(|entry| {
            let entry_path = PathBuf::from(entry);
            if entry_path.is_absolute() {
                entry_path
            } else {
                base_dir.join(entry_path)
            }
        })
        .collect()
}

pub(crate) fn is_jar_path(path: &Path) -> bool {
    has_extension(path, "jar")
}

fn is_class_path(path: &Path) -> bool {
    has_extension(path, "class")
}

fn has_extension(path: &Path, expected: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}
