//! Read-only alias data accumulated across exporter generations.
//!
//! Everything here is built once on first use and never mutated.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

/// Canonical tables in export and import order.
pub const CANONICAL_TABLES: &[&str] = &[
    "users",
    "accounts",
    "sessions",
    "api_keys",
    "owner_profiles",
    "readers",
    "categories",
    "topics",
    "posts",
    "post_related",
    "notes",
    "pages",
    "drafts",
    "draft_histories",
    "comments",
    "recentlies",
    "says",
    "links",
    "projects",
    "snippets",
    "subscribes",
    "activities",
    "analyzes",
    "slug_trackers",
    "file_references",
    "ai_summaries",
    "ai_deep_readings",
    "meta_presets",
    "search_documents",
    "serverless_storages",
    "webhooks",
    "webhook_events",
    "options",
];

/// Legacy collection names and spellings mapped onto canonical tables.
pub static TABLE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("user", "users"),
        ("account", "accounts"),
        ("session", "sessions"),
        ("user_sessions", "sessions"),
        ("usersessions", "sessions"),
        ("apikeys", "api_keys"),
        ("api_key", "api_keys"),
        ("ownerprofiles", "owner_profiles"),
        ("reader", "readers"),
        ("category", "categories"),
        ("topic", "topics"),
        ("post", "posts"),
        ("postrelated", "post_related"),
        ("note", "notes"),
        ("page", "pages"),
        ("draft", "drafts"),
        ("drafthistories", "draft_histories"),
        ("draft_history", "draft_histories"),
        ("comment", "comments"),
        ("recently", "recentlies"),
        ("say", "says"),
        ("link", "links"),
        ("project", "projects"),
        ("snippet", "snippets"),
        ("subscribe", "subscribes"),
        ("activity", "activities"),
        ("analyze", "analyzes"),
        ("analyses", "analyzes"),
        ("slugtrackers", "slug_trackers"),
        ("slug_tracker", "slug_trackers"),
        ("filereferences", "file_references"),
        ("file_reference", "file_references"),
        ("aisummaries", "ai_summaries"),
        ("ai_summary", "ai_summaries"),
        ("aideepreadings", "ai_deep_readings"),
        ("metapresets", "meta_presets"),
        ("searchdocuments", "search_documents"),
        ("serverlessstorages", "serverless_storages"),
        ("serverless_storage", "serverless_storages"),
        ("webhook", "webhooks"),
        ("webhookevents", "webhook_events"),
        ("webhook_event", "webhook_events"),
        ("option", "options"),
    ])
});

/// Field names whose canonical column is not derivable by case conversion.
pub static GLOBAL_COLUMN_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("created", "created_at"),
        ("modified", "modified_at"),
        ("updated", "modified_at"),
        ("updatedAt", "modified_at"),
        ("updated_at", "modified_at"),
        ("ref", "ref_id"),
        ("parent", "parent_id"),
        ("category", "category_id"),
        ("topic", "topic_id"),
        ("creator", "creator_id"),
    ])
});

/// Per-table field aliases; these win over [`GLOBAL_COLUMN_ALIASES`].
pub static TABLE_COLUMN_ALIASES: Lazy<HashMap<&'static str, HashMap<&'static str, &'static str>>> =
    Lazy::new(|| {
        HashMap::from([
            ("notes", HashMap::from([("secret", "public_at"), ("hasMemory", "bookmark")])),
            ("comments", HashMap::from([("commentsIndex", "comments_index"), ("ref", "ref_id")])),
            ("links", HashMap::from([("type", "link_type"), ("state", "link_state")])),
            (
                "users",
                HashMap::from([
                    ("lastLoginTime", "last_login_at"),
                    ("lastLoginIp", "last_login_ip"),
                    ("authCode", "auth_code"),
                ]),
            ),
            ("slug_trackers", HashMap::from([("type", "ref_type"), ("targetId", "ref_id")])),
            ("says", HashMap::from([("origin", "source")])),
            ("recentlies", HashMap::from([("up", "up_votes"), ("down", "down_votes")])),
        ])
    });

/// Version markers written by the legacy document mapper.
pub static EXCLUDED_FIELDS: Lazy<HashSet<&'static str>> = Lazy::new(|| HashSet::from(["__v"]));

/// Document identifier field of the legacy exporter.
pub const LEGACY_ID_FIELD: &str = "_id";

/// Historical reference-type spellings mapped onto the current singular term.
pub static REF_TYPE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("post", "post"),
        ("posts", "post"),
        ("note", "note"),
        ("notes", "note"),
        ("page", "page"),
        ("pages", "page"),
        ("recently", "recently"),
        ("recentlies", "recently"),
        ("say", "say"),
        ("says", "say"),
        ("project", "project"),
        ("projects", "project"),
    ])
});

/// Tables whose `ref_type` column is canonicalized.
pub const REF_TYPE_TABLES: &[&str] = &["comments", "slug_trackers"];

/// Legacy standalone option names (after [`config_key`]) mapped onto
/// sections of the unified config blob.
pub static CONFIG_SECTION_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("seo", "seo"),
        ("seooptions", "seo"),
        ("url", "url"),
        ("urls", "url"),
        ("siteurl", "url"),
        ("mailoptions", "mail_options"),
        ("mail", "mail_options"),
        ("commentoptions", "comment_options"),
        ("comment", "comment_options"),
        ("backupoptions", "backup_options"),
        ("backup", "backup_options"),
        ("baidusearchoptions", "baidu_search_options"),
        ("bingsearchoptions", "bing_search_options"),
        ("algoliasearchoptions", "algolia_search_options"),
        ("meilisearchoptions", "meili_search_options"),
        ("adminextra", "admin_extra"),
        ("friendlinkoptions", "friend_link_options"),
        ("textoptions", "text_options"),
        ("featurelist", "feature_list"),
        ("thirdpartyserviceintegration", "third_party_service_integration"),
        ("authsecurity", "auth_security"),
        ("ai", "ai"),
    ])
});

/// Normalise an option name for matching against [`CONFIG_SECTION_ALIASES`]:
/// lowercase with separators removed.
#[must_use]
pub fn config_key(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|ch| !matches!(ch, '_' | '-' | '.' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}
