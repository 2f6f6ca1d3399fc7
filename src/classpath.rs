use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use crate::dispatcher::ClassLookup;
use crate::scan::ScanOutput;

/// Resolved class lookup keyed by internal class name.
///
/// Input classes shadow classpath classes; among classpath entries the first
/// one in scan order wins.
pub(crate) struct ClasspathIndex<'a> {
    classes: BTreeMap<&'a str, &'a [u8]>,
}

impl ClasspathIndex<'_> {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }
}

impl ClassLookup for ClasspathIndex<'_> {
    fn find_class(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.classes.get(name).map(|bytes| bytes.to_vec()))
    }
}

pub(crate) fn resolve_classpath(scan: &ScanOutput) -> Result<ClasspathIndex<'_>> {
    let mut input_map: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for entry in &scan.entries {
        if let Some(name) = entry.class_name.as_deref() {
            input_map.entry(name).or_default().push(entry.path.as_str());
        }
    }

    let mut duplicates = Vec::new();
    for (name, paths) in &input_map {
        if paths.len() > 1 {
            duplicates.push(format!("{name}: {paths:?}"));
        }
    }
    if !duplicates.is_empty() {
        anyhow::bail!("duplicate classes found: {}", duplicates.join(", "));
    }

    let mut classes = BTreeMap::new();
    for entry in &scan.entries {
        if let Some(name) = entry.class_name.as_deref() {
            classes.insert(name, entry.bytes.as_slice());
        }
    }
    for class in &scan.classpath_classes {
        if classes.contains_key(class.name.as_str()) {
            debug!(
                class = class.name.as_str(),
                origin = %class.origin.display(),
                "classpath class shadowed"
            );
            continue;
        }
        classes.insert(class.name.as_str(), class.bytes.as_slice());
    }

    Ok(ClasspathIndex { classes })
}
