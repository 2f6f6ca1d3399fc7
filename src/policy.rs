//! Hierarchical nullness policy: package chain, then class, then member.
//!
//! An element's own marker always wins. Otherwise the class marker applies,
//! and otherwise the verdict of the nearest package, which inherits from its
//! parent unless it declares `@Nullable` itself. Package verdicts are shared
//! across classes through a [`PackageCache`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use tracing::debug;

use crate::ir::{ClassModel, Markers};

/// Root package prefix that bounds weaving, in internal (`/`) form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RootScope {
    prefix: String,
}

impl RootScope {
    /// Accepts `com.example`, `com/example` or either with a trailing separator.
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.replace('.', "/");
        let trimmed = normalized.strip_suffix('/').unwrap_or(&normalized);
        if trimmed.is_empty() {
            anyhow::bail!("root package must not be empty");
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c == ';' || c == '[')
        {
            anyhow::bail!("root package contains invalid characters: {raw:?}");
        }
        if trimmed.split('/').any(str::is_empty) {
            anyhow::bail!("root package has an empty segment: {raw:?}");
        }
        Ok(Self {
            prefix: trimmed.to_string(),
        })
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Plain string prefix test on an internal class or package name.
    pub(crate) fn contains(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }
}

/// Package verdicts shared by every class woven in one run.
///
/// Entries are never replaced: concurrent resolvers of one package compute the
/// same value and the first insert is the one kept.
#[derive(Debug, Default)]
pub(crate) struct PackageCache {
    verdicts: RwLock<HashMap<String, bool>>,
}

impl PackageCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, package: &str) -> Option<bool> {
        self.verdicts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(package)
            .copied()
    }

    /// Store a verdict unless one is already present; returns the stored value.
    pub(crate) fn insert(&self, package: &str, verdict: bool) -> bool {
        let mut verdicts = self
            .verdicts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *verdicts.entry(package.to_string()).or_insert(verdict)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.verdicts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Source of package-level markers, usually the package-info class.
pub(crate) trait PackageMarkers {
    fn package_markers(&self, package: &str) -> Result<Markers>;
}

/// Verdicts for every field, parameter and return slot of one class.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ResolvedPolicy {
    pub(crate) class_verdict: bool,
    /// Parallel to `ClassModel::fields`.
    pub(crate) fields: Vec<bool>,
    /// Parallel to `ClassModel::methods`.
    pub(crate) methods: Vec<MethodPolicy>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodPolicy {
    pub(crate) parameters: Vec<bool>,
    pub(crate) returns: bool,
}

pub(crate) struct PolicyResolver<'a> {
    root: &'a RootScope,
    cache: &'a PackageCache,
    markers: &'a dyn PackageMarkers,
}

impl<'a> PolicyResolver<'a> {
    pub(crate) fn new(
        root: &'a RootScope,
        cache: &'a PackageCache,
        markers: &'a dyn PackageMarkers,
    ) -> Self {
        Self {
            root,
            cache,
            markers,
        }
    }

    /// Verdict for a package; false outside the root scope.
    pub(crate) fn package_verdict(&self, package: &str) -> Result<bool> {
        if package.is_empty() || !self.root.contains(package) {
            return Ok(false);
        }
        if let Some(verdict) = self.cache.get(package) {
            return Ok(verdict);
        }
        let parent = match package.rsplit_once('/') {
            Some((parent, _)) => self.package_verdict(parent)?,
            None => false,
        };
        let markers = self.markers.package_markers(package)?;
        let verdict = markers.explicit().unwrap_or(parent);
        debug!(package, verdict, "resolved package policy");
        Ok(self.cache.insert(package, verdict))
    }

    pub(crate) fn resolve(&self, class: &ClassModel) -> Result<ResolvedPolicy> {
        let package_verdict = self.package_verdict(class.package())?;
        let class_verdict = class_verdict(class.markers, package_verdict);
        let fields = class
            .fields
            .iter()
            .map(|field| element_verdict(field.markers, class_verdict))
            .collect();
        let methods = class
            .methods
            .iter()
            .map(|method| MethodPolicy {
                parameters: method
                    .parameters
                    .iter()
                    .map(|parameter| element_verdict(parameter.markers, class_verdict))
                    .collect(),
                returns: element_verdict(method.return_markers, class_verdict),
            })
            .collect();
        Ok(ResolvedPolicy {
            class_verdict,
            fields,
            methods,
        })
    }
}

pub(crate) fn class_verdict(markers: Markers, package_verdict: bool) -> bool {
    markers.explicit().unwrap_or(package_verdict)
}

pub(crate) fn element_verdict(markers: Markers, class_verdict: bool) -> bool {
    markers.explicit().unwrap_or(class_verdict)
}
