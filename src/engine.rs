use anyhow::{Context, Result};
use opentelemetry::{Context as OtelContext, KeyValue};
use rayon::prelude::*;
use tracing::debug;

use crate::dispatcher::{ClassLookup, Dispatcher, Outcome, WovenClass};
use crate::scan::InputEntry;
use crate::telemetry::{Telemetry, add_current_span_event};
use crate::transform::WeaveStats;

/// Weaving engine that runs every input class through one dispatcher.
pub(crate) struct Engine {
    dispatcher: Dispatcher,
}

impl Engine {
    /// Engine whose classes share one package verdict cache.
    pub(crate) fn new(root_package: &str) -> Result<Self> {
        let dispatcher = Dispatcher::new();
        dispatcher.activate(root_package)?;
        debug!(state = ?dispatcher.state(), "dispatcher ready");
        Ok(Self { dispatcher })
    }

    /// Transform the class entries in parallel. Results keep input order.
    pub(crate) fn weave(
        &self,
        entries: &[InputEntry],
        lookup: &dyn ClassLookup,
        telemetry: Option<&Telemetry>,
    ) -> Result<EngineOutput> {
        let parent_cx = OtelContext::current();
        let classes = entries
            .par_iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry
                    .class_name
                    .as_deref()
                    .map(|name| (index, name, entry.bytes.as_slice()))
            })
            .map(|(index, name, bytes)| {
                let outcome = match telemetry {
                    Some(telemetry) => telemetry.in_class_span(name, &parent_cx, || {
                        self.transform(lookup, name, bytes)
                    }),
                    None => self.transform(lookup, name, bytes),
                }?;
                Ok(ClassResult {
                    entry: index,
                    name: name.to_string(),
                    outcome,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut totals = WeaveStats::default();
        for class in &classes {
            if let Outcome::Rewritten(woven) = &class.outcome {
                totals.add(&woven.stats);
            }
        }
        Ok(EngineOutput { classes, totals })
    }

    fn transform(&self, lookup: &dyn ClassLookup, name: &str, bytes: &[u8]) -> Result<Outcome> {
        let outcome = self
            .dispatcher
            .transform(lookup, name, bytes)
            .with_context(|| format!("failed to weave {name}"))?;
        match &outcome {
            Outcome::Rewritten(woven) => {
                debug!(class = name, guards = woven.stats.guards(), "rewritten");
                add_current_span_event(
                    "class.rewritten",
                    &[KeyValue::new(
                        "nullcheck_weaver.guards",
                        woven.stats.guards() as i64,
                    )],
                );
            }
            Outcome::Unchanged(reason) => {
                debug!(class = name, reason = reason.label(), "unchanged");
            }
        }
        Ok(outcome)
    }
}

/// Outcome of one input class.
pub(crate) struct ClassResult {
    /// Position of the class in the scanned input entries.
    pub(crate) entry: usize,
    pub(crate) name: String,
    pub(crate) outcome: Outcome,
}

/// Per-class outcomes plus guard totals of rewritten classes.
pub(crate) struct EngineOutput {
    pub(crate) classes: Vec<ClassResult>,
    pub(crate) totals: WeaveStats,
}

impl EngineOutput {
    /// Rewritten classes by input entry position.
    pub(crate) fn rewritten(&self) -> impl Iterator<Item = (usize, &WovenClass)> {
        self.classes.iter().filter_map(|class| match &class.outcome {
            Outcome::Rewritten(woven) => Some((class.entry, woven)),
            Outcome::Unchanged(_) => None,
        })
    }

    pub(crate) fn rewritten_count(&self) -> usize {
        self.rewritten().count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::dispatcher::SkipReason;
    use crate::test_harness::{ClassFileBuilder, SourceFile, jvm_harness};

    const NOT_NULL: &str = "Lnotnullcheckweaver/NotNull;";

    struct MapLookup(HashMap<String, Vec<u8>>);

    impl ClassLookup for MapLookup {
        fn find_class(&self, name: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.0.get(name).cloned())
        }
    }

    fn entry(path: &str, class_name: Option<&str>, bytes: Vec<u8>) -> InputEntry {
        InputEntry {
            path: path.to_string(),
            class_name: class_name.map(str::to_string),
            bytes,
        }
    }

    fn identity_class(name: &str, annotated: bool) -> Vec<u8> {
        let mut builder = ClassFileBuilder::new(name, "java/lang/Object");
        if annotated {
            builder.annotate_class(NOT_NULL, false);
        }
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

    #[test]
    fn weave_keeps_entry_order_and_totals_guards() {
        let entries = vec![
            entry("README.txt", None, b"hello".to_vec()),
            entry(
                "com/example/A.class",
                Some("com/example/A"),
                identity_class("com/example/A", true),
            ),
            entry(
                "com/example/B.class",
                Some("com/example/B"),
                identity_class("com/example/B", false),
            ),
            entry(
                "org/other/C.class",
                Some("org/other/C"),
                identity_class("org/other/C", true),
            ),
            entry(
                "com/example/D.class",
                Some("com/example/D"),
                identity_class("com/example/D", true),
            ),
        ];
        let engine = Engine::new("com.example").expect("engine");
        let lookup = MapLookup(HashMap::new());

        let output = engine.weave(&entries, &lookup, None).expect("weave");

        let positions: Vec<usize> = output.classes.iter().map(|class| class.entry).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
        assert_eq!(output.rewritten_count(), 2);
        assert_eq!(output.totals.arguments, 2);
        assert_eq!(output.totals.results, 2);
        assert!(matches!(
            output.classes[1].outcome,
            Outcome::Unchanged(SkipReason::NothingToGuard)
        ));
        assert!(matches!(
            output.classes[2].outcome,
            Outcome::Unchanged(SkipReason::OutOfScope)
        ));
    }

    #[test]
    fn invalid_root_package_is_rejected() {
        assert!(Engine::new("").is_err());
    }

    fn source(path: &str, contents: &str) -> SourceFile {
        SourceFile {
            path: path.to_string(),
            contents: contents.to_string(),
        }
    }

    fn package_info() -> SourceFile {
        source(
            "com/example/package-info.java",
            "@notnullcheckweaver.NotNull\npackage com.example;\n",
        )
    }

    #[test]
    fn jdk_argument_and_result_checks() {
        let Some(harness) = jvm_harness() else {
            return;
        };
        let sources = [
            package_info(),
            source(
                "com/example/Main.java",
                r#"
package com.example;

import notnullcheckweaver.ArgumentNotNullCheckException;
import notnullcheckweaver.Nullable;
import notnullcheckweaver.ResultNotNullCheckException;

public class Main {
    static String echo(String value, @Nullable String fallback) {
        return value;
    }

    static String broken(boolean flag) {
        return flag ? "ok" : null;
    }

    public static void main(String[] args) {
        System.out.println(echo("x", null));
        try {
            echo(null, "y");
        } catch (ArgumentNotNullCheckException e) {
            System.out.println(e.getMessage() + "|" + e.getArgumentIndex());
        }
        System.out.println(broken(true));
        try {
            broken(false);
        } catch (ResultNotNullCheckException e) {
            System.out.println(e.getMessage());
        }
    }
}
"#,
            ),
        ];

        let run = harness
            .compile_weave_and_run(&sources, "com.example", "com.example.Main")
            .expect("run");

        assert!(run.success, "stderr: {}", run.stderr);
        assert_eq!(
            run.stdout.lines().collect::<Vec<_>>(),
            vec![
                "x",
                "Argument for @NotNull parameter 0 is null.|0",
                "ok",
                "Returning null from a @NotNull method.",
            ]
        );
    }

    #[test]
    fn jdk_field_checks() {
        let Some(harness) = jvm_harness() else {
            return;
        };
        let sources = [
            package_info(),
            source(
                "com/example/Main.java",
                r#"
package com.example;

import notnullcheckweaver.ConstructorFieldNotNullCheckException;
import notnullcheckweaver.NotNullCheckException;
import notnullcheckweaver.Nullable;

public class Main {
    static class Holder {
        String text;

        Holder(boolean init) {
            if (init) {
                text = "set";
            }
        }

        void assign(@Nullable String value) {
            text = value;
        }
    }

    static class Config {
        static final long LOADED_AT = System.nanoTime();
        static String NAME;

        static void touch() {
        }
    }

    public static void main(String[] args) {
        Holder holder = new Holder(true);
        System.out.println(holder.text);
        try {
            new Holder(false);
        } catch (ConstructorFieldNotNullCheckException e) {
            System.out.println(e.getMessage() + "|" + e.getFieldName());
        }
        try {
            holder.assign(null);
        } catch (NotNullCheckException e) {
            System.out.println(e.getMessage());
        }
        try {
            Config.touch();
        } catch (ExceptionInInitializerError e) {
            System.out.println(e.getCause().getMessage());
        }
    }
}
"#,
            ),
        ];

        let run = harness
            .compile_weave_and_run(&sources, "com.example", "com.example.Main")
            .expect("run");

        assert!(run.success, "stderr: {}", run.stderr);
        assert_eq!(
            run.stdout.lines().collect::<Vec<_>>(),
            vec![
                "set",
                "Constructor did not initialize @NotNull field text.|text",
                "Attempt to assign null to @NotNull field.",
                "Static initializer did not initialize @NotNull field NAME.",
            ]
        );
    }

    #[test]
    fn jdk_field_read_and_interface_constant_checks() {
        let Some(harness) = jvm_harness() else {
            return;
        };
        let sources = [
            package_info(),
            source(
                "com/example/Main.java",
                r#"
package com.example;

import notnullcheckweaver.NotNullCheckException;
import notnullcheckweaver.Nullable;

public class Main {
    static class Early {
        String text;

        Early() {
            length();
            text = "late";
        }

        int length() {
            return text.length();
        }
    }

    static class Source {
        @Nullable
        static String missing() {
            return null;
        }
    }

    interface Defaults {
        String GREETING = String.valueOf("hello");
    }

    interface Broken {
        String VALUE = Source.missing();
    }

    public static void main(String[] args) {
        try {
            new Early();
        } catch (NotNullCheckException e) {
            System.out.println(e.getMessage());
        }
        System.out.println(Defaults.GREETING);
        try {
            System.out.println(Broken.VALUE);
        } catch (ExceptionInInitializerError e) {
            System.out.println(e.getCause().getMessage());
        }
    }
}
"#,
            ),
        ];

        let run = harness
            .compile_weave_and_run(&sources, "com.example", "com.example.Main")
            .expect("run");

        assert!(run.success, "stderr: {}", run.stderr);
        assert_eq!(
            run.stdout.lines().collect::<Vec<_>>(),
            vec![
                "Attempt to read uninitialized @NotNull field.",
                "hello",
                "Attempt to assign null to @NotNull field.",
            ]
        );
    }

    #[test]
    fn jdk_static_field_without_initializer_can_be_assigned_later() {
        let Some(harness) = jvm_harness() else {
            return;
        };
        let sources = [
            package_info(),
            source(
                "com/example/Main.java",
                r#"
package com.example;

public class Main {
    static class Registry {
        static String current;

        static void install(String value) {
            current = value;
        }
    }

    public static void main(String[] args) {
        Registry.install("ready");
        System.out.println(Registry.current);
    }
}
"#,
            ),
        ];

        let run = harness
            .compile_weave_and_run(&sources, "com.example", "com.example.Main")
            .expect("run");

        assert!(run.success, "stderr: {}", run.stderr);
        assert_eq!(run.stdout.trim(), "ready");
    }

    #[test]
    fn jdk_inner_class_argument_index_counts_outer_instance() {
        let Some(harness) = jvm_harness() else {
            return;
        };
        let sources = [
            package_info(),
            source(
                "com/example/Main.java",
                r#"
package com.example;

import notnullcheckweaver.ArgumentNotNullCheckException;

public class Main {
    class Inner {
        Inner(String value) {
        }
    }

    public static void main(String[] args) {
        try {
            new Main().new Inner(null);
        } catch (ArgumentNotNullCheckException e) {
            System.out.println(e.getArgumentIndex());
        }
    }
}
"#,
            ),
        ];

        let run = harness
            .compile_weave_and_run(&sources, "com.example", "com.example.Main")
            .expect("run");

        assert!(run.success, "stderr: {}", run.stderr);
        assert_eq!(run.stdout.trim(), "1");
    }

    #[test]
    fn jdk_classes_outside_root_are_untouched() {
        let Some(harness) = jvm_harness() else {
            return;
        };
        let sources = [
            package_info(),
            source(
                "com/example/Main.java",
                r#"
package com.example;

public class Main {
    static String echo(String value) {
        return value;
    }

    public static void main(String[] args) {
        System.out.println(echo(null));
    }
}
"#,
            ),
        ];
        let compiled = harness.compile(&sources).expect("compile");

        let woven = harness
            .weave(compiled.classes_dir(), "org.elsewhere")
            .expect("weave");
        let run = harness
            .run(woven.output_dir(), "com.example.Main")
            .expect("run");

        assert_eq!(woven.engine.rewritten_count(), 0);
        assert!(run.success, "stderr: {}", run.stderr);
        assert_eq!(run.stdout.trim(), "null");
    }
}
