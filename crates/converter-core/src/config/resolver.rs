//! Inheritance-aware configuration resolution.
//!
//! Resolution walks `parent` references from the requested fragment up to
//! the root, then folds the chain root-first onto [`baseline`]. Each section
//! is merged field by field:
//!
//! | kind               | strategy                                      |
//! |--------------------|-----------------------------------------------|
//! | scalar             | override wins when present                    |
//! | list               | override entries prepended to base entries    |
//! | map                | override keys overlaid onto base map          |
//! | not inheritable    | reset to absent at every merge step           |

use super::job::*;
use crate::error::ConfigError;
#[cfg(test)]
use crate::error::{Error, PositionError};
use crate::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Merges fragments along their inheritance chain and validates the result.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    fragments: HashMap<String, JobConfigFragment>,
    sources: HashSet<String>,
}

impl ConfigResolver {
    /// Create a resolver over the known fragments and registered source names.
    pub fn new<F, S>(fragments: F, sources: S) -> Self
    where
        F: IntoIterator<Item = JobConfigFragment>,
        S: IntoIterator<Item = String>,
    {
        Self {
            fragments: fragments
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect(),
            sources: sources.into_iter().collect(),
        }
    }

    /// Look up a fragment by name.
    pub fn fragment(&self, name: &str) -> Option<&JobConfigFragment> {
        self.fragments.get(name)
    }

    /// Resolve a fragment into its effective configuration.
    ///
    /// The fragment does not have to be registered; its parents do.
    pub fn resolve(&self, fragment: &JobConfigFragment) -> Result<EffectiveJobConfig> {
        let chain = self.inheritance_chain(fragment)?;
        debug!(
            config = %fragment.name,
            chain = ?chain.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "Resolving converter job config"
        );

        let merged = chain
            .iter()
            .rev()
            .fold(baseline(), |acc, next| merge(&acc, next));

        self.validate(&merged, fragment)
    }

    /// Resolve a registered fragment by name.
    pub fn resolve_named(&self, name: &str) -> Result<EffectiveJobConfig> {
        let fragment = self
            .fragments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownJobConfig(name.to_string()))?;
        self.resolve(fragment)
    }

    /// Resolve every registered non-prototype fragment, sorted by name.
    pub fn predefined(&self) -> Result<Vec<EffectiveJobConfig>> {
        let mut names: Vec<&String> = self
            .fragments
            .values()
            .filter(|f| !f.is_prototype())
            .map(|f| &f.name)
            .collect();
        names.sort();
        names.into_iter().map(|n| self.resolve_named(n)).collect()
    }

    /// Ordered chain from the fragment up to its root ancestor.
    pub fn inheritance_chain<'a>(
        &'a self,
        fragment: &'a JobConfigFragment,
    ) -> Result<Vec<&'a JobConfigFragment>> {
        let mut chain = vec![fragment];
        let mut seen = HashSet::from([fragment.name.as_str()]);
        let mut current = fragment;

        while let Some(parent_name) = current.parent.as_deref() {
            let parent = self
                .fragments
                .get(parent_name)
                .filter(|_| seen.insert(parent_name))
                .ok_or_else(|| ConfigError::CyclicOrMissingParent {
                    config: current.name.clone(),
                    parent: parent_name.to_string(),
                })?;
            chain.push(parent);
            current = parent;
        }

        Ok(chain)
    }

    /// Check required fields and turn a merged fragment into an effective config.
    ///
    /// `requested` supplies the values of not-inheritable fields. Every absent
    /// required field is reported at once.
    pub fn validate(
        &self,
        merged: &JobConfigFragment,
        requested: &JobConfigFragment,
    ) -> Result<EffectiveJobConfig> {
        let mut missing = Vec::new();
        let mut require = |value: &Option<String>, property: &str| {
            if value.as_deref().map_or(true, str::is_empty) {
                missing.push(property.to_string());
            }
        };
        require(&merged.rawdata_source.name, "rawdata_source.name");
        require(&merged.rawdata_source.topic, "rawdata_source.topic");
        require(&merged.target_storage.root, "target_storage.root");
        require(&merged.target_storage.path, "target_storage.path");
        require(&merged.target_storage.version, "target_storage.version");

        if !missing.is_empty() {
            return Err(ConfigError::MissingRequiredProperty {
                config: requested.name.clone(),
                properties: missing,
            }
            .into());
        }

        let source_name = merged.rawdata_source.name.clone().unwrap_or_default();
        if !self.sources.contains(&source_name) {
            return Err(ConfigError::UnknownSourceReference(source_name).into());
        }

        let settings = &merged.converter_settings;
        let max_records_before_flush = positive(
            settings.max_records_before_flush,
            "converter_settings.max_records_before_flush",
        )?;
        let max_seconds_before_flush = positive(
            settings.max_seconds_before_flush,
            "converter_settings.max_seconds_before_flush",
        )?;

        let initial_position = merged
            .rawdata_source
            .initial_position
            .as_deref()
            .unwrap_or("LAST")
            .parse::<InitialPosition>()?;

        let d = merged.debug.clone();
        let ts = merged.target_storage.clone();
        let td = &merged.target_dataset;

        Ok(EffectiveJobConfig {
            name: requested.name.clone(),
            parent: merged.parent.clone(),
            job_id: requested.job_id,
            active_by_default: merged.active_by_default.unwrap_or(true),
            debug: DebugSettings {
                dryrun: d.dryrun.unwrap_or(false),
                development_mode: d.development_mode.unwrap_or(false),
                log_failed_rawdata: d.log_failed_rawdata.unwrap_or(false),
                log_skipped_rawdata: d.log_skipped_rawdata.unwrap_or(false),
                log_all_rawdata: d.log_all_rawdata.unwrap_or(false),
                log_all_converted: d.log_all_converted.unwrap_or(false),
                store_failed_rawdata: d.store_failed_rawdata.unwrap_or(false),
                store_skipped_rawdata: d.store_skipped_rawdata.unwrap_or(false),
                store_all_rawdata: d.store_all_rawdata.unwrap_or(false),
                store_all_converted: d.store_all_converted.unwrap_or(false),
                local_storage_path: d.local_storage_path,
                local_storage_password: d.local_storage_password,
                included_rawdata_entries: d.included_rawdata_entries.unwrap_or_default(),
            },
            converter_settings: ConverterSettings {
                max_records_before_flush,
                max_seconds_before_flush,
                max_records_total: settings.max_records_total,
                rawdata_samples: settings.rawdata_samples.unwrap_or(0),
                skipped_messages: settings.skipped_messages.clone().unwrap_or_default(),
            },
            rawdata_source: RawdataSourceRef {
                name: source_name,
                topic: merged.rawdata_source.topic.clone().unwrap_or_default(),
                initial_position,
            },
            target_storage: TargetStorage {
                root: ts.root.unwrap_or_default(),
                path: ts.path.unwrap_or_default(),
                version: ts.version.unwrap_or_default(),
                sa_key_file: ts.sa_key_file,
            },
            target_dataset: TargetDataset {
                valuation: td.valuation.unwrap_or(Valuation::Internal),
                dataset_type: td.dataset_type.unwrap_or(DatasetType::Bounded),
                publish_metadata: td.publish_metadata.unwrap_or(false),
            },
            pseudo_rules: merged.pseudo_rules.clone().unwrap_or_default(),
            converter_config: merged.converter_config.clone().unwrap_or_default(),
        })
    }
}

fn positive(value: Option<u64>, property: &str) -> Result<u64> {
    match value {
        Some(v) if v > 0 => Ok(v),
        _ => Err(ConfigError::InvalidValue {
            property: property.to_string(),
            message: "must be a positive number".to_string(),
        }
        .into()),
    }
}

/// The fragment every effective config is folded onto.
pub fn baseline() -> JobConfigFragment {
    JobConfigFragment {
        name: "default".to_string(),
        active_by_default: Some(true),
        debug: DebugFragment {
            dryrun: Some(false),
            development_mode: Some(false),
            log_failed_rawdata: Some(false),
            log_skipped_rawdata: Some(false),
            log_all_rawdata: Some(false),
            log_all_converted: Some(false),
            store_failed_rawdata: Some(false),
            store_skipped_rawdata: Some(false),
            store_all_rawdata: Some(false),
            store_all_converted: Some(false),
            ..Default::default()
        },
        converter_settings: ConverterSettingsFragment {
            max_records_before_flush: Some(1_000_000),
            max_seconds_before_flush: Some(300),
            rawdata_samples: Some(1),
            ..Default::default()
        },
        rawdata_source: RawdataSourceFragment {
            initial_position: Some("LAST".to_string()),
            ..Default::default()
        },
        target_dataset: TargetDatasetFragment {
            valuation: Some(Valuation::Internal),
            dataset_type: Some(DatasetType::Bounded),
            publish_metadata: Some(false),
        },
        ..Default::default()
    }
}

/// Merge `overrides` onto `base`, returning a new fragment.
///
/// Neither argument is modified.
pub fn merge(base: &JobConfigFragment, overrides: &JobConfigFragment) -> JobConfigFragment {
    JobConfigFragment {
        name: overrides.name.clone(),
        prototype: None,
        job_id: None,
        parent: overwrite(&base.parent, &overrides.parent),
        active_by_default: overwrite(&base.active_by_default, &overrides.active_by_default),
        debug: merge_debug(&base.debug, &overrides.debug),
        converter_settings: merge_settings(&base.converter_settings, &overrides.converter_settings),
        rawdata_source: RawdataSourceFragment {
            name: overwrite(&base.rawdata_source.name, &overrides.rawdata_source.name),
            topic: overwrite(&base.rawdata_source.topic, &overrides.rawdata_source.topic),
            initial_position: overwrite(
                &base.rawdata_source.initial_position,
                &overrides.rawdata_source.initial_position,
            ),
        },
        target_storage: TargetStorageFragment {
            root: overwrite(&base.target_storage.root, &overrides.target_storage.root),
            path: overwrite(&base.target_storage.path, &overrides.target_storage.path),
            version: overwrite(&base.target_storage.version, &overrides.target_storage.version),
            sa_key_file: overwrite(
                &base.target_storage.sa_key_file,
                &overrides.target_storage.sa_key_file,
            ),
        },
        target_dataset: TargetDatasetFragment {
            valuation: overwrite(&base.target_dataset.valuation, &overrides.target_dataset.valuation),
            dataset_type: overwrite(
                &base.target_dataset.dataset_type,
                &overrides.target_dataset.dataset_type,
            ),
            publish_metadata: overwrite(
                &base.target_dataset.publish_metadata,
                &overrides.target_dataset.publish_metadata,
            ),
        },
        pseudo_rules: prepend(&base.pseudo_rules, &overrides.pseudo_rules),
        converter_config: overlay(&base.converter_config, &overrides.converter_config),
    }
}

fn merge_debug(base: &DebugFragment, o: &DebugFragment) -> DebugFragment {
    DebugFragment {
        dryrun: overwrite(&base.dryrun, &o.dryrun),
        development_mode: overwrite(&base.development_mode, &o.development_mode),
        log_failed_rawdata: overwrite(&base.log_failed_rawdata, &o.log_failed_rawdata),
        log_skipped_rawdata: overwrite(&base.log_skipped_rawdata, &o.log_skipped_rawdata),
        log_all_rawdata: overwrite(&base.log_all_rawdata, &o.log_all_rawdata),
        log_all_converted: overwrite(&base.log_all_converted, &o.log_all_converted),
        store_failed_rawdata: overwrite(&base.store_failed_rawdata, &o.store_failed_rawdata),
        store_skipped_rawdata: overwrite(&base.store_skipped_rawdata, &o.store_skipped_rawdata),
        store_all_rawdata: overwrite(&base.store_all_rawdata, &o.store_all_rawdata),
        store_all_converted: overwrite(&base.store_all_converted, &o.store_all_converted),
        local_storage_path: overwrite(&base.local_storage_path, &o.local_storage_path),
        local_storage_password: overwrite(&base.local_storage_password, &o.local_storage_password),
        included_rawdata_entries: prepend(
            &base.included_rawdata_entries,
            &o.included_rawdata_entries,
        ),
    }
}

fn merge_settings(
    base: &ConverterSettingsFragment,
    o: &ConverterSettingsFragment,
) -> ConverterSettingsFragment {
    ConverterSettingsFragment {
        max_records_before_flush: overwrite(
            &base.max_records_before_flush,
            &o.max_records_before_flush,
        ),
        max_seconds_before_flush: overwrite(
            &base.max_seconds_before_flush,
            &o.max_seconds_before_flush,
        ),
        max_records_total: overwrite(&base.max_records_total, &o.max_records_total),
        rawdata_samples: overwrite(&base.rawdata_samples, &o.rawdata_samples),
        skipped_messages: prepend(&base.skipped_messages, &o.skipped_messages),
    }
}

fn overwrite<T: Clone>(base: &Option<T>, overrides: &Option<T>) -> Option<T> {
    overrides.as_ref().or(base.as_ref()).cloned()
}

fn prepend<T: Clone>(base: &Option<Vec<T>>, overrides: &Option<Vec<T>>) -> Option<Vec<T>> {
    match (base, overrides) {
        (_, None) => base.clone(),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => Some(o.iter().chain(b.iter()).cloned().collect()),
    }
}

fn overlay<V: Clone>(
    base: &Option<BTreeMap<String, V>>,
    overrides: &Option<BTreeMap<String, V>>,
) -> Option<BTreeMap<String, V>> {
    match (base, overrides) {
        (_, None) => base.clone(),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => {
            let mut merged = b.clone();
            merged.extend(o.iter().map(|(k, v)| (k.clone(), v.clone())));
            Some(merged)
        }
    }
}
