mod checks;
mod classfile;
mod classpath;
mod descriptor;
mod dispatcher;
mod engine;
mod ir;
mod opcodes;
mod output;
mod policy;
mod report;
mod runtime;
mod scan;
mod telemetry;
#[cfg(test)]
mod test_harness;
mod transform;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use tracing::info;

use crate::checks::HELPER_CLASS;
use crate::classpath::resolve_classpath;
use crate::engine::Engine;
use crate::output::{RuntimeMode, write_output};
use crate::policy::RootScope;
use crate::report::{ReportContext, build_report, write_report};
use crate::scan::{InputLayout, is_jar_path, scan_inputs};
use crate::telemetry::{Telemetry, current_trace_id, init_logging, with_span};

/// CLI arguments for nullcheck-weaver execution.
#[derive(Parser, Debug)]
#[command(
    name = "nullcheck-weaver",
    about = "Weave @NotNull runtime checks into JVM class files and JAR files.",
    version
)]
struct Cli {
    /// Class file, directory or JAR to weave.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Output directory, or JAR path when the input is a JAR.
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
    /// Only classes under this package are woven (`com.example` or `com/example`).
    #[arg(long, value_name = "PACKAGE")]
    root_package: String,
    #[arg(long, value_name = "PATH")]
    classpath: Vec<PathBuf>,
    #[arg(long, value_enum, default_value_t = RuntimeMode::Emit)]
    runtime: RuntimeMode,
    /// Write a JSON report; `-` for stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// OTLP/HTTP endpoint for trace export.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    let telemetry = match cli.otel.clone() {
        Some(endpoint) => Some(Telemetry::new(endpoint)?),
        None => None,
    };
    let result = match telemetry.as_ref() {
        Some(telemetry) => telemetry.in_span("nullcheck-weaver", &[], || run(&cli, Some(telemetry))),
        None => run(&cli, None),
    };
    if let Some(telemetry) = &telemetry {
        telemetry.shutdown()?;
    }
    result
}

fn run(cli: &Cli, telemetry: Option<&Telemetry>) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    for entry in &cli.classpath {
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
    }
    let root = RootScope::parse(&cli.root_package).context("invalid --root-package")?;
    if same_path(&cli.input, &cli.output) {
        anyhow::bail!("output must differ from input: {}", cli.output.display());
    }

    let started_at = Instant::now();
    let scan_started_at = Instant::now();
    let input_attributes = [KeyValue::new(
        "nullcheck_weaver.input",
        cli.input.display().to_string(),
    )];
    let scan = with_span(telemetry, "input.scan", &input_attributes, || {
        scan_inputs(&cli.input, &cli.classpath, telemetry)
    })?;
    let scan_duration_ms = scan_started_at.elapsed().as_millis();
    if scan.layout == InputLayout::Jar && !is_jar_path(&cli.output) {
        anyhow::bail!(
            "output for a JAR input must be a .jar path: {}",
            cli.output.display()
        );
    }

    let classpath = resolve_classpath(&scan)?;
    if cli.runtime == RuntimeMode::External && !classpath.contains(HELPER_CLASS) {
        anyhow::bail!(
            "--runtime external requires {HELPER_CLASS} on the input or classpath; use --runtime emit to write it"
        );
    }

    let weave_started_at = Instant::now();
    let engine = Engine::new(root.prefix())?;
    let woven = engine.weave(&scan.entries, &classpath, telemetry)?;
    let weave_duration_ms = weave_started_at.elapsed().as_millis();

    let summary = write_output(&scan, &woven, cli.runtime, &cli.output, telemetry)?;
    info!(
        classes = scan.class_count,
        rewritten = woven.rewritten_count(),
        guards = woven.totals.guards(),
        "weaving finished"
    );

    if let Some(path) = cli.report.as_deref() {
        let report = build_report(
            ReportContext {
                root_package: root.prefix(),
                runtime: cli.runtime,
                trace_id: current_trace_id(),
                classpath_class_count: scan.classpath_classes.len(),
            },
            &woven,
            summary,
        );
        let mut writer = report_writer(path)?;
        write_report(&mut writer, &report)?;
    }

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} scan_ms={} weave_ms={} classes={} rewritten={} classpath_classes={}",
            started_at.elapsed().as_millis(),
            scan_duration_ms,
            weave_duration_ms,
            scan.class_count,
            woven.rewritten_count(),
            classpath.len()
        );
    }

    Ok(())
}

fn report_writer(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    Ok(Box::new(
        File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
    ))
}

fn same_path(input: &Path, output: &Path) -> bool {
    match (input.canonicalize(), output.canonicalize()) {
        (Ok(input), Ok(output)) => input == output,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::classfile::ClassFile;
    use crate::test_harness::ClassFileBuilder;
    use crate::transform::has_woven_marker;

    fn cli(input: &Path, output: &Path, runtime: RuntimeMode) -> Cli {
        Cli {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            root_package: "com.example".to_string(),
            classpath: Vec::new(),
            runtime,
            report: None,
            otel: None,
            quiet: true,
            timing: false,
        }
    }

    fn write_annotated_class(root: &Path) {
        let mut builder = ClassFileBuilder::new("com/example/Foo", "java/lang/Object");
        builder.annotate_class("Lnotnullcheckweaver/NotNull;", true);
        builder.add_method(
            0x0009,
            "id",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
            vec![0x2a, 0xb0],
            1,
            1,
        );
        let path = root.join("com/example/Foo.class");
        fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
        fs::write(path, builder.finish()).expect("write class");
    }

    #[test]
    fn run_weaves_directory_and_writes_report() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let input = temp_dir.path().join("classes");
        write_annotated_class(&input);
        let output = temp_dir.path().join("woven");
        let report = temp_dir.path().join("report.json");
        let mut args = cli(&input, &output, RuntimeMode::Emit);
        args.report = Some(report.clone());

        run(&args, None).expect("run");

        let bytes = fs::read(output.join("com/example/Foo.class")).expect("woven class");
        assert!(has_woven_marker(&ClassFile::parse(&bytes).expect("parse")));
        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(report).expect("report")).expect("json");
        assert_eq!(value["root_package"], "com/example");
        assert_eq!(value["classes"][0]["status"], "rewritten");
    }

    #[test]
    fn external_runtime_requires_the_helper_class() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let input = temp_dir.path().join("classes");
        write_annotated_class(&input);
        let output = temp_dir.path().join("woven");

        let error = run(&cli(&input, &output, RuntimeMode::External), None)
            .expect_err("missing runtime");

        assert!(format!("{error:#}").contains(HELPER_CLASS));
        assert!(!output.exists());
    }

    #[test]
    fn invalid_root_package_is_rejected_before_scanning() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let input = temp_dir.path().join("classes");
        write_annotated_class(&input);
        let mut args = cli(&input, &temp_dir.path().join("woven"), RuntimeMode::Emit);
        args.root_package = "com..example".to_string();

        let error = run(&args, None).expect_err("invalid root");

        assert!(format!("{error:#}").contains("root-package"));
    }

    #[test]
    fn output_must_differ_from_input() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let input = temp_dir.path().join("classes");
        write_annotated_class(&input);

        let error = run(&cli(&input, &input, RuntimeMode::Emit), None).expect_err("same path");

        assert!(format!("{error:#}").contains("must differ"));
    }
}
