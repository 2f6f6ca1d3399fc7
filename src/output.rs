use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, info};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::engine::EngineOutput;
use crate::runtime::{RuntimeClass, runtime_classes};
use crate::scan::{InputLayout, ScanOutput};
use crate::telemetry::{Telemetry, with_span};

/// Where the check runtime comes from at execution time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RuntimeMode {
    /// Write the annotation and check classes next to the woven classes.
    #[default]
    Emit,
    /// Expect the check classes to be provided separately.
    External,
}

/// Counts of what was written.
#[derive(Debug, Default, Serialize)]
pub(crate) struct OutputSummary {
    pub(crate) entries: usize,
    pub(crate) rewritten: usize,
    pub(crate) runtime_classes: usize,
}

/// Mirror the input layout into `output`, replacing rewritten classes.
pub(crate) fn write_output(
    scan: &ScanOutput,
    woven: &EngineOutput,
    runtime: RuntimeMode,
    output: &Path,
    telemetry: Option<&Telemetry>,
) -> Result<OutputSummary> {
    let replacements: BTreeMap<usize, &[u8]> = woven
        .rewritten()
        .map(|(entry, class)| (entry, class.bytes.as_slice()))
        .collect();
    let runtime = match runtime {
        RuntimeMode::Emit => emitted_runtime(scan)?,
        RuntimeMode::External => Vec::new(),
    };

    let mut files: Vec<(&str, &[u8])> = scan
        .entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let bytes = replacements
                .get(&index)
                .copied()
                .unwrap_or(entry.bytes.as_slice());
            (entry.path.as_str(), bytes)
        })
        .collect();
    let runtime_paths: Vec<String> = runtime
        .iter()
        .map(|class| format!("{}.class", class.name))
        .collect();
    for (path, class) in runtime_paths.iter().zip(&runtime) {
        files.push((path.as_str(), class.bytes.as_slice()));
    }

    let span_attributes = [KeyValue::new(
        "nullcheck_weaver.output_path",
        output.display().to_string(),
    )];
    with_span(telemetry, "output.write", &span_attributes, || {
        match scan.layout {
            InputLayout::Jar => write_jar(output, &files),
            InputLayout::Directory | InputLayout::ClassFile => write_directory(output, &files),
        }
    })?;

    info!(
        output = %output.display(),
        entries = files.len(),
        rewritten = replacements.len(),
        "output written"
    );
    Ok(OutputSummary {
        entries: files.len(),
        rewritten: replacements.len(),
        runtime_classes: runtime.len(),
    })
}

/// Runtime classes not already present in the input.
fn emitted_runtime(scan: &ScanOutput) -> Result<Vec<RuntimeClass>> {
    let present: BTreeSet<&str> = scan
        .entries
        .iter()
        .filter_map(|entry| entry.class_name.as_deref())
        .collect();
    let mut classes = runtime_classes()?;
    classes.retain(|class| {
        let missing = !present.contains(class.name.as_str());
        if !missing {
            debug!(class = class.name.as_str(), "runtime class provided by input");
        }
        missing
    });
    Ok(classes)
}

fn write_directory(output: &Path, files: &[(&str, &[u8])]) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    for (path, bytes) in files {
        let target = path
            .split('/')
            .fold(output.to_path_buf(), |target, part| target.join(part));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
    }
    Ok(())
}

fn write_jar(output: &Path, files: &[(&str, &[u8])]) -> Result<()> {
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = fs::File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (path, bytes) in files {
        writer
            .start_file(*path, options)
            .with_context(|| format!("failed to add {}:{}", output.display(), path))?;
        writer
            .write_all(bytes)
            .with_context(|| format!("failed to write {}:{}", output.display(), path))?;
    }
    writer
        .finish()
        .with_context(|| format!("failed to finish {}", output.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use zip::ZipArchive;

    use super::*;
    use crate::checks::HELPER_CLASS;
    use crate::classpath::resolve_classpath;
    use crate::engine::Engine;
    use crate::scan::InputEntry;
    use crate::test_harness::ClassFileBuilder;
    use crate::transform::has_woven_marker;
    use crate::classfile::ClassFile;

    fn annotated_class(name: &str) -> Vec<u8> {
        let mut builder = ClassFileBuilder::new(name, "java/lang/Object");
        builder.annotate_class("Lnotnullcheckweaver/NotNull;", true);
        builder.add_method(
            0x0009,
            "id",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
            vec![0x2a, 0xb0],
            1,
            1,
        );
        builder.finish()
    }

    fn scan(layout: InputLayout) -> ScanOutput {
        let entries = vec![
            InputEntry {
                path: "META-INF/MANIFEST.MF".to_string(),
                class_name: None,
                bytes: b"Manifest-Version: 1.0\n\n".to_vec(),
            },
            InputEntry {
                path: "com/example/Foo.class".to_string(),
                class_name: Some("com/example/Foo".to_string()),
                bytes: annotated_class("com/example/Foo"),
            },
        ];
        ScanOutput {
            layout,
            class_count: 1,
            entries,
            classpath_classes: Vec::new(),
        }
    }

    fn weave(scan: &ScanOutput) -> EngineOutput {
        let classpath = resolve_classpath(scan).expect("classpath");
        Engine::new("com.example")
            .expect("engine")
            .weave(&scan.entries, &classpath, None)
            .expect("weave")
    }

    #[test]
    fn directory_output_mirrors_input_and_emits_runtime() {
        let scan = scan(InputLayout::Directory);
        let woven = weave(&scan);
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let output = temp_dir.path().join("out");

        let summary =
            write_output(&scan, &woven, RuntimeMode::Emit, &output, None).expect("write");

        assert_eq!(summary.rewritten, 1);
        assert_eq!(summary.runtime_classes, 10);
        assert_eq!(
            fs::read(output.join("META-INF/MANIFEST.MF")).expect("manifest"),
            scan.entries[0].bytes
        );
        let class = ClassFile::parse(&fs::read(output.join("com/example/Foo.class")).expect("class"))
            .expect("parse");
        assert!(has_woven_marker(&class));
        assert!(output.join(format!("{HELPER_CLASS}.class")).exists());
    }

    #[test]
    fn jar_output_keeps_entry_order_without_runtime_when_external() {
        let scan = scan(InputLayout::Jar);
        let woven = weave(&scan);
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let output = temp_dir.path().join("out.jar");

        let summary =
            write_output(&scan, &woven, RuntimeMode::External, &output, None).expect("write");

        assert_eq!(summary.runtime_classes, 0);
        let mut archive = ZipArchive::new(fs::File::open(&output).expect("open")).expect("zip");
        let names: Vec<String> = (0..archive.len())
            .map(|index| archive.by_index(index).expect("entry").name().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "META-INF/MANIFEST.MF");
        let mut bytes = Vec::new();
        archive
            .by_name("com/example/Foo.class")
            .expect("entry")
            .read_to_end(&mut bytes)
            .expect("read");
        assert_ne!(bytes, scan.entries[1].bytes);
    }

    #[test]
    fn runtime_classes_present_in_input_are_not_duplicated() {
        let mut scan = scan(InputLayout::Directory);
        scan.entries.push(InputEntry {
            path: format!("{HELPER_CLASS}.class"),
            class_name: Some(HELPER_CLASS.to_string()),
            bytes: b"helper".to_vec(),
        });

        let runtime = emitted_runtime(&scan).expect("runtime");

        assert_eq!(runtime.len(), 9);
        assert!(runtime.iter().all(|class| class.name != HELPER_CLASS));
    }
}
