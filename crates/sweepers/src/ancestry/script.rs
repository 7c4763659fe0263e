//! Server-side painless script applied by every ancestry update.
//!
//! Serverless OpenSearch collections do not support named/stored scripts, so
//! the script is inlined into each update action. Minified template below;
//! the unminified equivalent:
//!
//! ```text
//! boolean changed = false;
//!
//! def refsKey = 'ANCESTRY_REFS_METADATA_KEY_PLACEHOLDER';
//! if (ctx._source[refsKey] == null) {
//!     ctx._source[refsKey] = [];
//!     changed = true;
//! }
//! def existing = new HashSet();
//! for (item in ctx._source[refsKey]) {
//!     existing.add(item);
//! }
//! for (item in params.new_items) {
//!     if (!existing.contains(item)) {
//!         ctx._source[refsKey].add(item);
//!         existing.add(item);
//!         changed = true;
//!     }
//! }
//!
//! for (field in params.parent_refs.entrySet()) {
//!     def key = field.getKey();
//!     if (ctx._source[key] == null) {
//!         ctx._source[key] = [];
//!         changed = true;
//!     }
//!     def seen = new HashSet();
//!     for (item in ctx._source[key]) {
//!         seen.add(item);
//!     }
//!     for (item in field.getValue()) {
//!         if (!seen.contains(item)) {
//!             ctx._source[key].add(item);
//!             seen.add(item);
//!             changed = true;
//!         }
//!     }
//! }
//!
//! if (params.sweeper_version != null) {
//!     def versionKey = 'ANCESTRY_VERSION_METADATA_KEY_PLACEHOLDER';
//!     if (ctx._source[versionKey] == null || ctx._source[versionKey] != params.sweeper_version) {
//!         ctx._source[versionKey] = params.sweeper_version;
//!         changed = true;
//!     }
//! }
//!
//! if (!changed) {
//!     ctx.op = 'none';  // prevents reindexing if nothing changed
//! }
//! ```

use std::sync::LazyLock;

use common::document::ANCESTRY_REFS_KEY;

use crate::versioning::SWEEPERS_ANCESTRY_VERSION_METADATA_KEY;

// Placeholders keep the template free of characters that would need escaping
// in the metadata keys themselves.
const REFS_KEY_PLACEHOLDER: &str = "ANCESTRY_REFS_METADATA_KEY_PLACEHOLDER";
const VERSION_KEY_PLACEHOLDER: &str = "ANCESTRY_VERSION_METADATA_KEY_PLACEHOLDER";

const ANCESTRY_UPDATE_SCRIPT_TEMPLATE: &str = "boolean c=false;def k='ANCESTRY_REFS_METADATA_KEY_PLACEHOLDER';if(ctx._source[k]==null){ctx._source[k]=[];c=true;}def e=new HashSet();for(i in ctx._source[k]){e.add(i);}for(i in params.new_items){if(!e.contains(i)){ctx._source[k].add(i);e.add(i);c=true;}}for(f in params.parent_refs.entrySet()){def fk=f.getKey();if(ctx._source[fk]==null){ctx._source[fk]=[];c=true;}def s=new HashSet();for(i in ctx._source[fk]){s.add(i);}for(i in f.getValue()){if(!s.contains(i)){ctx._source[fk].add(i);s.add(i);c=true;}}}if(params.sweeper_version!=null){def v='ANCESTRY_VERSION_METADATA_KEY_PLACEHOLDER';if(ctx._source[v]==null||ctx._source[v]!=params.sweeper_version){ctx._source[v]=params.sweeper_version;c=true;}}if(!c){ctx.op='none';}";

pub static ANCESTRY_UPDATE_SCRIPT: LazyLock<String> = LazyLock::new(|| {
    ANCESTRY_UPDATE_SCRIPT_TEMPLATE
        .replace(REFS_KEY_PLACEHOLDER, ANCESTRY_REFS_KEY)
        .replace(
            VERSION_KEY_PLACEHOLDER,
            &SWEEPERS_ANCESTRY_VERSION_METADATA_KEY,
        )
});
