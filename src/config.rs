use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::merge::MergePolicy;

pub const DEFAULT_CONFIG_FILE: &str = "catalog.toml";
const DEFAULT_CHECKPOINT_EVERY: usize = 50;
const MONTANIA_NO_IMAGE: &str = "https://montania.innovacionfac.com/assets/uploads/no_image.png?v=1";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Items processed between checkpoint writes, unless the origin overrides it.
    pub checkpoint_every: usize,
    pub extract_timeout_secs: u64,
    pub merge: MergePolicy,
    pub origins: BTreeMap<String, OriginProfile>,
    pub sink: SinkSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("data"),
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            extract_timeout_secs: 45,
            merge: MergePolicy::default(),
            origins: builtin_origins(),
            sink: SinkSettings::default(),
        }
    }
}

/// How one upstream catalog names its fields and how to pull them from a page.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OriginProfile {
    /// Raw field name → canonical field name.
    pub aliases: BTreeMap<String, String>,
    /// Image URLs the catalog serves when a product has no picture.
    pub placeholder_images: Vec<String>,
    pub checkpoint_every: Option<usize>,
    /// Raw field name → regex; the first capture group is the value.
    pub patterns: BTreeMap<String, String>,
    /// Raw fields whose absence makes an extraction a failure.
    pub required: Vec<String>,
}

impl OriginProfile {
    /// Every raw field name this origin is known to produce, sorted.
    pub fn raw_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self
            .patterns
            .keys()
            .chain(self.aliases.keys())
            .map(String::as_str)
            .collect();
        fields.sort_unstable();
        fields.dedup();
        fields
    }

    /// Raw names that map onto `canonical`.
    pub fn aliases_for<'a>(&'a self, canonical: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.aliases
            .iter()
            .filter(move |(_, target)| target.as_str() == canonical)
            .map(|(raw, _)| raw.as_str())
    }

    fn fill_from(&mut self, builtin: &OriginProfile) {
        if self.aliases.is_empty() {
            self.aliases = builtin.aliases.clone();
        }
        if self.placeholder_images.is_empty() {
            self.placeholder_images = builtin.placeholder_images.clone();
        }
        if self.checkpoint_every.is_none() {
            self.checkpoint_every = builtin.checkpoint_every;
        }
        if self.required.is_empty() {
            self.required = builtin.required.clone();
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkSettings {
    pub sqlite_path: PathBuf,
    /// Base URL of a PostgREST-style endpoint, e.g. `https://x.supabase.co/rest/v1`.
    pub rest_url: Option<String>,
    pub table: String,
    /// Passed through verbatim on every request.
    pub headers: BTreeMap<String, String>,
    pub batch_size: usize,
    pub pause_ms: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        SinkSettings {
            sqlite_path: PathBuf::from("data/catalog.sqlite"),
            rest_url: None,
            table: "productos".to_string(),
            headers: BTreeMap::new(),
            batch_size: 50,
            pause_ms: 100,
        }
    }
}

impl Settings {
    pub fn origin(&self, tag: &str) -> Result<&OriginProfile> {
        self.origins.get(tag).with_context(|| {
            let known: Vec<&str> = self.origins.keys().map(String::as_str).collect();
            format!("Unknown origin '{}' (configured: {})", tag, known.join(", "))
        })
    }

    pub fn checkpoint_every(&self, tag: &str) -> usize {
        self.origins
            .get(tag)
            .and_then(|p| p.checkpoint_every)
            .unwrap_or(self.checkpoint_every)
            .max(1)
    }

    pub fn worklist_path(&self, tag: &str) -> PathBuf {
        self.data_dir.join(tag).join("worklist.json")
    }

    pub fn checkpoint_path(&self, tag: &str) -> PathBuf {
        self.data_dir.join(tag).join("checkpoint.json")
    }

    pub fn products_path(&self, tag: &str) -> PathBuf {
        self.data_dir.join(tag).join("products.json")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    fn with_builtin_origins(mut self) -> Self {
        for (tag, builtin) in builtin_origins() {
            self.origins
                .entry(tag)
                .and_modify(|p| p.fill_from(&builtin))
                .or_insert(builtin);
        }
        self
    }
}

/// Load settings from `catalog.toml` (or `path`) layered under `CATALOG_*` env vars.
/// An explicit path must exist; the default file is optional.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let file = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let cfg = Config::builder()
        .add_source(File::from(file.as_path()).required(path.is_some()))
        .add_source(
            Environment::with_prefix("CATALOG")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration {:?}", file))?;

    from_config(cfg)
}

pub fn from_config(cfg: Config) -> Result<Settings> {
    let settings: Settings = cfg
        .try_deserialize()
        .context("Invalid catalog configuration")?;
    Ok(settings.with_builtin_origins())
}

fn builtin_origins() -> BTreeMap<String, OriginProfile> {
    let aliases = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(raw, canonical)| (raw.to_string(), canonical.to_string()))
            .collect()
    };

    let montania = OriginProfile {
        aliases: aliases(&[
            ("nombre", "name"),
            ("marca", "brand"),
            ("precio", "price"),
            ("codigo_barras", "upc"),
            ("imagen", "sourceImageUrl"),
        ]),
        placeholder_images: vec![MONTANIA_NO_IMAGE.to_string()],
        checkpoint_every: Some(50),
        patterns: BTreeMap::new(),
        required: vec!["nombre".to_string()],
    };

    let rol = OriginProfile {
        aliases: aliases(&[
            ("nombre", "name"),
            ("sku", "upc"),
            ("precio", "price"),
            ("imagen", "sourceImageUrl"),
        ]),
        placeholder_images: Vec::new(),
        checkpoint_every: Some(20),
        patterns: BTreeMap::new(),
        required: vec!["nombre".to_string(), "sku".to_string()],
    };

    BTreeMap::from([("montania".to_string(), montania), ("rol".to_string(), rol)])
}
