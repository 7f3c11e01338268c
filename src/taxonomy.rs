use crate::error::{NormalizerError, Result};
use crate::schema::{ConceptId, ExpectedSign};
use crate::text::normalize_label;
use log::{debug, info};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

pub const BUILTIN_TAXONOMY_VERSION: &str = "jp-pl-2025.1";

static BUILTIN: Lazy<std::result::Result<Arc<Taxonomy>, String>> = Lazy::new(|| {
    Taxonomy::from_json_str(include_str!("../taxonomy/jp-pl-2025.1.json"))
        .map(Arc::new)
        .map_err(|e| e.to_string())
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ComponentSign {
    Add,
    Subtract,
}

/// One signed term of a statement identity, e.g. `- cost_of_sales`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ComponentTerm {
    pub concept_id: ConceptId,
    pub sign: ComponentSign,
}

/// A concept as written in a taxonomy source file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConceptDefinition {
    #[schemars(description = "Stable identifier, never reused for a different line item")]
    pub id: ConceptId,

    #[schemars(description = "Name used in the output template (e.g. '売上高')")]
    pub display_name: String,

    #[serde(default)]
    #[schemars(description = "Alternative labels that mean exactly this line item")]
    pub synonyms: Vec<String>,

    #[serde(default)]
    #[schemars(
        description = "Labels that report this line item as a loss (e.g. '営業損失'); values under them are negated"
    )]
    pub loss_synonyms: Vec<String>,

    pub expected_sign: ExpectedSign,

    #[serde(default)]
    #[schemars(description = "Whether a valid output record must contain this concept")]
    pub required: bool,

    #[serde(default)]
    #[schemars(description = "Signed concepts this line is the total of, used for identity checks")]
    pub components: Vec<ComponentTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MigrationNote {
    pub concept_id: ConceptId,
    pub note: String,
}

/// Versioned taxonomy document, loaded read-only at startup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaxonomySource {
    pub version: String,
    pub concepts: Vec<ConceptDefinition>,
    #[serde(default)]
    pub retired_ids: Vec<ConceptId>,
    #[serde(default)]
    pub migrations: Vec<MigrationNote>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalConcept {
    pub id: ConceptId,
    pub display_name: String,
    /// Normalized label keys, display name excluded.
    pub synonyms: BTreeSet<String>,
    pub loss_synonyms: BTreeSet<String>,
    pub expected_sign: ExpectedSign,
    pub required: bool,
    pub components: Vec<ComponentTerm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LabelEntry {
    concept_index: usize,
    negated: bool,
}

/// A normalized label key resolved to its concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelMatch<'a> {
    pub concept: &'a CanonicalConcept,
    /// The label is a loss synonym; its value must be negated.
    pub negated: bool,
}

/// Immutable registry of canonical concepts for one taxonomy version.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    version: String,
    concepts: Vec<CanonicalConcept>,
    index: BTreeMap<String, LabelEntry>,
    retired_ids: BTreeSet<ConceptId>,
    migrations: Vec<MigrationNote>,
}

impl Taxonomy {
    pub fn from_source(source: TaxonomySource) -> Result<Self> {
        let fatal = |msg: String| NormalizerError::FatalConfig(msg);

        if source.version.trim().is_empty() {
            return Err(fatal("taxonomy version must not be empty".to_string()));
        }
        if source.concepts.is_empty() {
            return Err(fatal(format!(
                "taxonomy '{}' declares no concepts",
                source.version
            )));
        }

        let mut concepts: Vec<CanonicalConcept> = Vec::with_capacity(source.concepts.len());
        let mut index: BTreeMap<String, LabelEntry> = BTreeMap::new();

        for (concept_index, def) in source.concepts.iter().enumerate() {
            if def.id.trim().is_empty() {
                return Err(fatal(format!("concept #{} has an empty id", concept_index)));
            }
            if concepts.iter().any(|c| c.id == def.id) {
                return Err(fatal(format!("duplicate concept id '{}'", def.id)));
            }
            if def.display_name.trim().is_empty() {
                return Err(fatal(format!("concept '{}' has an empty display name", def.id)));
            }
            if !def.loss_synonyms.is_empty() && def.expected_sign != ExpectedSign::Either {
                return Err(fatal(format!(
                    "concept '{}' declares loss synonyms but its expected sign is {:?}",
                    def.id, def.expected_sign
                )));
            }

            let mut synonyms = BTreeSet::new();
            let mut loss_synonyms = BTreeSet::new();

            let labels = std::iter::once((&def.display_name, false))
                .chain(def.synonyms.iter().map(|s| (s, false)))
                .chain(def.loss_synonyms.iter().map(|s| (s, true)));

            for (label, negated) in labels {
                let key = normalize_label(label);
                if key.is_empty() {
                    return Err(fatal(format!(
                        "concept '{}' has a blank synonym",
                        def.id
                    )));
                }

                match index.get(&key).copied() {
                    Some(existing) if existing.concept_index != concept_index => {
                        return Err(fatal(format!(
                            "synonym '{}' is declared by both '{}' and '{}'",
                            label, concepts[existing.concept_index].id, def.id
                        )));
                    }
                    Some(existing) if existing.negated != negated => {
                        return Err(fatal(format!(
                            "label '{}' of concept '{}' is declared both as a synonym and a loss synonym",
                            label, def.id
                        )));
                    }
                    Some(_) => continue,
                    None => {
                        index.insert(
                            key.clone(),
                            LabelEntry {
                                concept_index,
                                negated,
                            },
                        );
                    }
                }

                if negated {
                    loss_synonyms.insert(key);
                } else if key != normalize_label(&def.display_name) {
                    synonyms.insert(key);
                }
            }

            concepts.push(CanonicalConcept {
                id: def.id.clone(),
                display_name: def.display_name.clone(),
                synonyms,
                loss_synonyms,
                expected_sign: def.expected_sign,
                required: def.required,
                components: def.components.clone(),
            });
        }

        for concept in &concepts {
            for term in &concept.components {
                if term.concept_id == concept.id {
                    return Err(fatal(format!(
                        "concept '{}' lists itself as a component",
                        concept.id
                    )));
                }
                if !concepts.iter().any(|c| c.id == term.concept_id) {
                    return Err(fatal(format!(
                        "concept '{}' refers to unknown component '{}'",
                        concept.id, term.concept_id
                    )));
                }
            }
        }

        let retired_ids: BTreeSet<ConceptId> = source.retired_ids.iter().cloned().collect();
        if let Some(active) = concepts.iter().find(|c| retired_ids.contains(&c.id)) {
            return Err(fatal(format!(
                "concept '{}' is both active and retired in taxonomy '{}'",
                active.id, source.version
            )));
        }

        debug!(
            "Loaded taxonomy {} with {} concepts and {} label keys",
            source.version,
            concepts.len(),
            index.len()
        );

        Ok(Self {
            version: source.version,
            concepts,
            index,
            retired_ids,
            migrations: source.migrations,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let source: TaxonomySource = serde_json::from_str(json)?;
        Self::from_source(source)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// The taxonomy shipped with the crate, loaded once per process.
    pub fn builtin() -> Result<Arc<Taxonomy>> {
        (*BUILTIN)
            .as_ref()
            .map(Arc::clone)
            .map_err(|msg| NormalizerError::FatalConfig(msg.clone()))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn concepts(&self) -> &[CanonicalConcept] {
        &self.concepts
    }

    pub fn concept(&self, id: &str) -> Option<&CanonicalConcept> {
        self.concepts.iter().find(|c| c.id == id)
    }

    pub fn lookup_by_label(&self, normalized_label: &str) -> Option<&ConceptId> {
        self.lookup_label(normalized_label).map(|m| &m.concept.id)
    }

    pub fn lookup_label(&self, normalized_label: &str) -> Option<LabelMatch<'_>> {
        self.index.get(normalized_label).map(|entry| LabelMatch {
            concept: &self.concepts[entry.concept_index],
            negated: entry.negated,
        })
    }

    /// Every label key with its concept, in key order.
    pub fn label_keys(&self) -> impl Iterator<Item = (&str, LabelMatch<'_>)> {
        self.index.iter().map(move |(key, entry)| {
            (
                key.as_str(),
                LabelMatch {
                    concept: &self.concepts[entry.concept_index],
                    negated: entry.negated,
                },
            )
        })
    }

    pub fn synonyms_for(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.concept(id).map(|c| &c.synonyms)
    }

    pub fn required_concepts(&self) -> impl Iterator<Item = &CanonicalConcept> {
        self.concepts.iter().filter(|c| c.required)
    }

    pub fn is_retired(&self, id: &str) -> bool {
        self.retired_ids.contains(id)
    }

    pub fn has_migration_note(&self, id: &str) -> bool {
        self.migrations.iter().any(|m| m.concept_id == id)
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!("# Canonical Taxonomy - {}\n\n", self.version));

        output.push_str("| Concept | ID | Sign | Required | Synonyms |\n");
        output.push_str("|---|---|---|---|---|\n");
        for concept in &self.concepts {
            let required_marker = if concept.required { "**[REQUIRED]**" } else { "" };
            let mut synonyms: Vec<String> = concept.synonyms.iter().cloned().collect();
            synonyms.extend(concept.loss_synonyms.iter().map(|s| format!("{} (loss)", s)));
            output.push_str(&format!(
                "| {} | `{}` | {:?} | {} | {} |\n",
                concept.display_name,
                concept.id,
                concept.expected_sign,
                required_marker,
                synonyms.join(", ")
            ));
        }
        output.push('\n');

        let identities: Vec<&CanonicalConcept> = self
            .concepts
            .iter()
            .filter(|c| !c.components.is_empty())
            .collect();
        if !identities.is_empty() {
            output.push_str("## Identities\n\n");
            for concept in identities {
                let terms: Vec<String> = concept
                    .components
                    .iter()
                    .enumerate()
                    .map(|(i, term)| match (i, term.sign) {
                        (0, ComponentSign::Add) => term.concept_id.clone(),
                        (0, ComponentSign::Subtract) => format!("-{}", term.concept_id),
                        (_, ComponentSign::Add) => format!("+ {}", term.concept_id),
                        (_, ComponentSign::Subtract) => format!("- {}", term.concept_id),
                    })
                    .collect();
                output.push_str(&format!("- {} = {}\n", concept.id, terms.join(" ")));
            }
            output.push('\n');
        }

        output
    }
}

/// All taxonomy versions known to the process. Built once at startup and
/// then shared read-only.
#[derive(Debug, Default, Clone)]
pub struct TaxonomyRegistry {
    versions: BTreeMap<String, Arc<Taxonomy>>,
    order: Vec<String>,
}

impl TaxonomyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the built-in taxonomy.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.insert(Taxonomy::builtin()?)?;
        Ok(registry)
    }

    pub fn register(&mut self, taxonomy: Taxonomy) -> Result<Arc<Taxonomy>> {
        self.insert(Arc::new(taxonomy))
    }

    fn insert(&mut self, taxonomy: Arc<Taxonomy>) -> Result<Arc<Taxonomy>> {
        let version = taxonomy.version().to_string();
        if self.versions.contains_key(&version) {
            return Err(NormalizerError::FatalConfig(format!(
                "taxonomy version '{}' is already registered",
                version
            )));
        }

        for earlier in self.order.iter().filter_map(|v| self.versions.get(v)) {
            for concept in taxonomy.concepts() {
                if taxonomy.has_migration_note(&concept.id) {
                    continue;
                }
                if earlier.is_retired(&concept.id) {
                    return Err(NormalizerError::FatalConfig(format!(
                        "taxonomy '{}' reuses id '{}' retired in '{}' without a migration note",
                        version,
                        concept.id,
                        earlier.version()
                    )));
                }
                if let Some(previous) = earlier.concept(&concept.id) {
                    if previous.display_name != concept.display_name {
                        return Err(NormalizerError::FatalConfig(format!(
                            "taxonomy '{}' redefines id '{}' ('{}' was '{}' in '{}') without a migration note",
                            version,
                            concept.id,
                            concept.display_name,
                            previous.display_name,
                            earlier.version()
                        )));
                    }
                }
            }
        }

        info!(
            "Registered taxonomy {} ({} concepts)",
            version,
            taxonomy.concepts().len()
        );

        self.order.push(version.clone());
        self.versions.insert(version, Arc::clone(&taxonomy));
        Ok(taxonomy)
    }

    pub fn get(&self, version: &str) -> Result<Arc<Taxonomy>> {
        self.versions
            .get(version)
            .cloned()
            .ok_or_else(|| NormalizerError::UnknownTaxonomyVersion(version.to_string()))
    }

    /// Registered versions in registration order.
    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn latest(&self) -> Option<Arc<Taxonomy>> {
        self.order.last().and_then(|v| self.versions.get(v)).cloned()
    }
}
