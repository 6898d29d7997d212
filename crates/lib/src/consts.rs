//! Constants shared across the crate.

pub const APP_NAME: &str = "rtsetup";

/// Default number of artifacts installed in parallel.
pub const MAX_CONCURRENCY: usize = 5;

/// Capacity of the channel between the build-progress stream and the install workers.
pub const READY_CHANNEL_CAPACITY: usize = 16;

/// Namespace of builder ingredients. Never built themselves.
pub const BUILDER_NAMESPACE: &str = "builder";

/// Namespace of libraries used by builders. Never built themselves.
pub const BUILDER_LIB_NAMESPACE: &str = "builder-lib";

/// Namespace of shared libraries installed alongside the language.
pub const SHARED_NAMESPACE: &str = "shared";

/// Builder that may consume patches from outside the object store.
pub const LEGACY_PATCH_BUILDER: &str = "camel";

/// URI scheme every patch location must use.
pub const OBJECT_STORE_SCHEME: &str = "s3://";

// The no-op builder attached to the synthetic terminal artifact.
pub const NOOP_BUILDER_NAME: &str = "noop-builder";
pub const NOOP_BUILDER_VERSION: &str = "0.0.1";
pub const NOOP_BUILDER_CHECKSUM: &str = "21d227eee2d263e171e45ab7357140220174ca83691fab65e0d422eee44e609f";
pub const NOOP_BUILDER_SOURCE_URI: &str = "s3://platform-sources/builder/21d227eee2d263e171e45ab7357140220174ca83691fab65e0d422eee44e609f/noop-builder.tar.gz";

/// Directory inside the install dir holding the runtime store.
pub const RUNTIME_STORE_DIR: &str = ".rtsetup";
pub const INSTALLATION_MARKER_FILE: &str = "installation_complete";
pub const RECIPE_FILE: &str = "recipe.json";
pub const BUILD_ENGINE_FILE: &str = "build_engine";
pub const ENVIRONMENT_FILE: &str = "environment.json";
pub const ARTIFACT_META_DIR: &str = "artifacts";
pub const TEMP_DIR: &str = "tmp";
pub const LOCK_FILENAME: &str = ".lock";

/// Overrides the artifact download cache location.
pub const CACHE_DIR_ENV: &str = "RTSETUP_CACHE_DIR";

/// Placeholder in environment definitions replaced by the install directory.
pub const INSTALLDIR_PLACEHOLDER: &str = "${INSTALLDIR}";

/// Environment fragment shipped inside alternative-engine artifacts.
pub const ALTERNATIVE_ENVDEF_FILE: &str = "runtime.json";

/// Metadata file shipped inside camel-engine artifacts.
pub const CAMEL_METADATA_FILE: &str = "metadata.json";
