//! Bit flags shaping engine output.
//!
//! Flags travel as `int64` on the wire and are passed through to the engine
//! unchanged.

pub const SZ_NO_FLAGS: i64 = 0;

// Export
pub const SZ_EXPORT_INCLUDE_MULTI_RECORD_ENTITIES: i64 = 1 << 0;
pub const SZ_EXPORT_INCLUDE_POSSIBLY_SAME: i64 = 1 << 1;
pub const SZ_EXPORT_INCLUDE_POSSIBLY_RELATED: i64 = 1 << 2;
pub const SZ_EXPORT_INCLUDE_NAME_ONLY: i64 = 1 << 3;
pub const SZ_EXPORT_INCLUDE_DISCLOSED: i64 = 1 << 4;
pub const SZ_EXPORT_INCLUDE_SINGLE_RECORD_ENTITIES: i64 = 1 << 5;
pub const SZ_EXPORT_INCLUDE_ALL_ENTITIES: i64 =
    SZ_EXPORT_INCLUDE_MULTI_RECORD_ENTITIES | SZ_EXPORT_INCLUDE_SINGLE_RECORD_ENTITIES;

// Entity detail
pub const SZ_ENTITY_INCLUDE_POSSIBLY_SAME_RELATIONS: i64 = 1 << 6;
pub const SZ_ENTITY_INCLUDE_POSSIBLY_RELATED_RELATIONS: i64 = 1 << 7;
pub const SZ_ENTITY_INCLUDE_NAME_ONLY_RELATIONS: i64 = 1 << 8;
pub const SZ_ENTITY_INCLUDE_DISCLOSED_RELATIONS: i64 = 1 << 9;
pub const SZ_ENTITY_INCLUDE_ALL_FEATURES: i64 = 1 << 10;
pub const SZ_ENTITY_INCLUDE_REPRESENTATIVE_FEATURES: i64 = 1 << 11;
pub const SZ_ENTITY_INCLUDE_ENTITY_NAME: i64 = 1 << 12;
pub const SZ_ENTITY_INCLUDE_RECORD_SUMMARY: i64 = 1 << 13;
pub const SZ_ENTITY_INCLUDE_RECORD_DATA: i64 = 1 << 14;
pub const SZ_ENTITY_INCLUDE_RECORD_MATCHING_INFO: i64 = 1 << 15;
pub const SZ_ENTITY_INCLUDE_RECORD_JSON_DATA: i64 = 1 << 16;
pub const SZ_ENTITY_INCLUDE_RECORD_FEATURES: i64 = 1 << 18;
pub const SZ_ENTITY_INCLUDE_RELATED_ENTITY_NAME: i64 = 1 << 19;
pub const SZ_ENTITY_INCLUDE_RELATED_MATCHING_INFO: i64 = 1 << 20;
pub const SZ_ENTITY_INCLUDE_RELATED_RECORD_SUMMARY: i64 = 1 << 21;
pub const SZ_ENTITY_INCLUDE_RELATED_RECORD_DATA: i64 = 1 << 22;
pub const SZ_ENTITY_INCLUDE_ALL_RELATIONS: i64 = SZ_ENTITY_INCLUDE_POSSIBLY_SAME_RELATIONS
    | SZ_ENTITY_INCLUDE_POSSIBLY_RELATED_RELATIONS
    | SZ_ENTITY_INCLUDE_NAME_ONLY_RELATIONS
    | SZ_ENTITY_INCLUDE_DISCLOSED_RELATIONS;

// Path finding
pub const SZ_FIND_PATH_INCLUDE_MATCHING_INFO: i64 = 1 << 30;
pub const SZ_FIND_PATH_STRICT_AVOID: i64 = 1 << 25;

// Search
pub const SZ_SEARCH_INCLUDE_RESOLVED: i64 = SZ_EXPORT_INCLUDE_MULTI_RECORD_ENTITIES;
pub const SZ_SEARCH_INCLUDE_POSSIBLY_SAME: i64 = SZ_EXPORT_INCLUDE_POSSIBLY_SAME;
pub const SZ_SEARCH_INCLUDE_POSSIBLY_RELATED: i64 = SZ_EXPORT_INCLUDE_POSSIBLY_RELATED;
pub const SZ_SEARCH_INCLUDE_NAME_ONLY: i64 = SZ_EXPORT_INCLUDE_NAME_ONLY;
pub const SZ_SEARCH_INCLUDE_ALL_ENTITIES: i64 = SZ_SEARCH_INCLUDE_RESOLVED
    | SZ_SEARCH_INCLUDE_POSSIBLY_SAME
    | SZ_SEARCH_INCLUDE_POSSIBLY_RELATED
    | SZ_SEARCH_INCLUDE_NAME_ONLY;

/// Return affected-entity info from mutating calls.
pub const SZ_WITH_INFO: i64 = 1 << 62;

// Defaults
pub const SZ_RECORD_DEFAULT_FLAGS: i64 = SZ_ENTITY_INCLUDE_RECORD_JSON_DATA;
pub const SZ_ENTITY_DEFAULT_FLAGS: i64 = SZ_ENTITY_INCLUDE_ALL_RELATIONS
    | SZ_ENTITY_INCLUDE_REPRESENTATIVE_FEATURES
    | SZ_ENTITY_INCLUDE_ENTITY_NAME
    | SZ_ENTITY_INCLUDE_RECORD_SUMMARY
    | SZ_ENTITY_INCLUDE_RECORD_DATA
    | SZ_ENTITY_INCLUDE_RECORD_MATCHING_INFO
    | SZ_ENTITY_INCLUDE_RELATED_ENTITY_NAME
    | SZ_ENTITY_INCLUDE_RELATED_RECORD_SUMMARY
    | SZ_ENTITY_INCLUDE_RELATED_MATCHING_INFO;
pub const SZ_EXPORT_DEFAULT_FLAGS: i64 = SZ_EXPORT_INCLUDE_ALL_ENTITIES
    | SZ_ENTITY_INCLUDE_ENTITY_NAME
    | SZ_ENTITY_INCLUDE_RECORD_DATA;
pub const SZ_FIND_PATH_DEFAULT_FLAGS: i64 = SZ_FIND_PATH_INCLUDE_MATCHING_INFO
    | SZ_ENTITY_INCLUDE_ENTITY_NAME
    | SZ_ENTITY_INCLUDE_RECORD_SUMMARY;
pub const SZ_WHY_ENTITIES_DEFAULT_FLAGS: i64 = SZ_ENTITY_INCLUDE_ENTITY_NAME
    | SZ_ENTITY_INCLUDE_RECORD_SUMMARY;
pub const SZ_SEARCH_BY_ATTRIBUTES_DEFAULT_FLAGS: i64 = SZ_SEARCH_INCLUDE_ALL_ENTITIES
    | SZ_ENTITY_INCLUDE_ENTITY_NAME
    | SZ_ENTITY_INCLUDE_RECORD_SUMMARY;

/// True when every bit of `flag` is set in `flags`.
pub fn has(flags: i64, flag: i64) -> bool {
    flags & flag == flag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has() {
        assert!(has(SZ_ENTITY_DEFAULT_FLAGS, SZ_ENTITY_INCLUDE_ENTITY_NAME));
        assert!(has(SZ_WITH_INFO | SZ_NO_FLAGS, SZ_WITH_INFO));
        assert!(!has(SZ_EXPORT_INCLUDE_MULTI_RECORD_ENTITIES, SZ_EXPORT_INCLUDE_ALL_ENTITIES));
    }
}
