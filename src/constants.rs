/// Section and key name constants to keep the settings schema consistent across the codebase

// Top-level sections of the settings document
pub const GLOBAL_SECTION: &str = "global";
pub const DATABASE_SECTION: &str = "database";
pub const IMPORT_SECTION: &str = "import";
pub const OPTIONAL_SECTION: &str = "optional";
pub const NETWORK_SECTION: &str = "network";
pub const ATTRIBUTES_SECTION: &str = "attributes";
pub const WEIGHTS_SECTION: &str = "weights";
pub const EXPORT_SECTION: &str = "export";

pub const KNOWN_SECTIONS: [&str; 8] = [
    GLOBAL_SECTION,
    DATABASE_SECTION,
    IMPORT_SECTION,
    OPTIONAL_SECTION,
    NETWORK_SECTION,
    ATTRIBUTES_SECTION,
    WEIGHTS_SECTION,
    EXPORT_SECTION,
];

// Keys shared by step sections
pub const TYPE_KEY: &str = "type";
pub const ON_EXISTING_KEY: &str = "on_existing";

/// SRID used when the global section does not set one (WGS 84)
pub const DEFAULT_SRID: &str = "4326";

// Database defaults
pub const DATABASE_ENV_VAR: &str = "GEOPIPE_DATABASE";
pub const DEFAULT_DATABASE_PATH: &str = "geopipe.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_JOURNAL_MODE: &str = "WAL";

// Base names of the tables written by the steps (prefixed with the case id when one is set)
pub const FEATURES_TABLE: &str = "features";
pub const EDGES_TABLE: &str = "edges";
pub const ATTRIBUTES_TABLE: &str = "attributes";
pub const SEARCH_INDEX_TABLE: &str = "search_index";
pub const LAYERS_TABLE: &str = "layers";

/// Tables only the pipeline stages may write; optional importers must not target them
pub const PIPELINE_TABLES: [&str; 5] = [
    FEATURES_TABLE,
    EDGES_TABLE,
    ATTRIBUTES_TABLE,
    SEARCH_INDEX_TABLE,
    LAYERS_TABLE,
];

/// Step type under which the optional importer set is registered
pub const OPTIONAL_IMPORTERS_TYPE: &str = "importers";

// Registered step types
pub const CSV_TYPE: &str = "csv";
pub const GEOJSON_TYPE: &str = "geojson";
