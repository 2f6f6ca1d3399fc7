//! Load-time transform dispatcher: decides per class whether to weave and
//! turns every recoverable failure into a pass-through.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::classfile::ClassFile;
use crate::ir::{ClassModel, Markers, element_markers};
use crate::policy::{PackageCache, PackageMarkers, PolicyResolver, RootScope};
use crate::transform::{InvariantViolation, WeaveStats, has_woven_marker, weave_class};

const PACKAGE_MARKER: &str = "package-info";

/// Class lookup of the host, used to read package-info classes.
pub(crate) trait ClassLookup: Sync {
    /// Bytes of the class with the given internal name, if present.
    fn find_class(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DispatcherState {
    Unregistered,
    Active,
}

/// Why a class was handed back unchanged.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum SkipReason {
    NotActive,
    OutOfScope,
    PackageMarker,
    AlreadyWoven,
    NothingToGuard,
    /// The class could not be woven; carries the error chain.
    Malformed(String),
}

impl SkipReason {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            SkipReason::NotActive => "not_active",
            SkipReason::OutOfScope => "out_of_scope",
            SkipReason::PackageMarker => "package_marker",
            SkipReason::AlreadyWoven => "already_woven",
            SkipReason::NothingToGuard => "nothing_to_guard",
            SkipReason::Malformed(_) => "malformed",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct WovenClass {
    pub(crate) bytes: Vec<u8>,
    pub(crate) stats: WeaveStats,
}

#[derive(Clone, Debug)]
pub(crate) enum Outcome {
    Unchanged(SkipReason),
    Rewritten(WovenClass),
}

/// Entry point the host calls for every class it is about to load.
pub(crate) struct Dispatcher {
    root: OnceLock<RootScope>,
    cache: Arc<PackageCache>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::with_cache(Arc::new(PackageCache::new()))
    }

    pub(crate) fn with_cache(cache: Arc<PackageCache>) -> Self {
        Self {
            root: OnceLock::new(),
            cache,
        }
    }

    pub(crate) fn state(&self) -> DispatcherState {
        if self.root.get().is_some() {
            DispatcherState::Active
        } else {
            DispatcherState::Unregistered
        }
    }

    /// Register the root package prefix. Only one activation is allowed.
    pub(crate) fn activate(&self, prefix: &str) -> Result<()> {
        let root = RootScope::parse(prefix).context("invalid root package")?;
        let normalized = root.prefix().to_string();
        self.root
            .set(root)
            .map_err(|_| anyhow::anyhow!("dispatcher is already active"))?;
        debug!(root = normalized.as_str(), "dispatcher active");
        Ok(())
    }

    /// Weave one class. Only invariant violations are returned as errors;
    /// every other failure yields `Unchanged(Malformed)` with the input kept.
    pub(crate) fn transform(
        &self,
        lookup: &dyn ClassLookup,
        name: &str,
        bytes: &[u8],
    ) -> Result<Outcome> {
        let Some(root) = self.root.get() else {
            return Ok(Outcome::Unchanged(SkipReason::NotActive));
        };
        if !root.contains(name) {
            return Ok(Outcome::Unchanged(SkipReason::OutOfScope));
        }
        if name.ends_with(PACKAGE_MARKER) {
            return Ok(Outcome::Unchanged(SkipReason::PackageMarker));
        }

        match self.weave(lookup, root, name, bytes) {
            Ok(outcome) => Ok(outcome),
            Err(error) if error.downcast_ref::<InvariantViolation>().is_some() => Err(error),
            Err(error) => {
                let message = format!("{error:#}");
                warn!(class = name, error = message.as_str(), "leaving class unwoven");
                Ok(Outcome::Unchanged(SkipReason::Malformed(message)))
            }
        }
    }

    fn weave(
        &self,
        lookup: &dyn ClassLookup,
        root: &RootScope,
        name: &str,
        bytes: &[u8],
    ) -> Result<Outcome> {
        let mut class = ClassFile::parse(bytes).context("parse class file")?;
        if has_woven_marker(&class) {
            return Ok(Outcome::Unchanged(SkipReason::AlreadyWoven));
        }
        let declared = class.name()?;
        if declared != name {
            anyhow::bail!("class file declares {declared}");
        }

        let model = ClassModel::from_class(&class)?;
        let packages = LookupPackageMarkers { lookup };
        let resolver = PolicyResolver::new(root, &self.cache, &packages);
        let policy = resolver.resolve(&model).context("resolve nullness policy")?;

        match weave_class(&mut class, &model, &policy)? {
            None => Ok(Outcome::Unchanged(SkipReason::NothingToGuard)),
            Some(stats) => Ok(Outcome::Rewritten(WovenClass {
                bytes: class.to_bytes().context("write woven class")?,
                stats,
            })),
        }
    }
}

/// Reads package markers from `<package>/package-info` through the host.
struct LookupPackageMarkers<'a> {
    lookup: &'a dyn ClassLookup,
}

impl PackageMarkers for LookupPackageMarkers<'_> {
    fn package_markers(&self, package: &str) -> Result<Markers> {
        let name = format!("{package}/{PACKAGE_MARKER}");
        let Some(bytes) = self.lookup.find_class(&name)? else {
            return Ok(Markers::default());
        };
        let class = ClassFile::parse(&bytes).with_context(|| format!("parse {name}"))?;
        element_markers(&class, &class.attributes).with_context(|| format!("read annotations of {name}"))
    }
}
