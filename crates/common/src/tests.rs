use super::*;

#[test]
fn page_layout_constants_are_consistent() {
    assert_eq!(SLOTS_PER_PAGE, 512);
    assert_eq!(PAGE_SIZE % INT_SIZE, 0);
    assert_eq!(HEADER_SIZE, INT_SIZE);
}

#[test]
fn metadata_columns_precede_user_columns() {
    assert_eq!(INDIRECTION_COLUMN, 0);
    assert_eq!(RID_COLUMN, 1);
    assert_eq!(TIMESTAMP_COLUMN, 2);
    assert_eq!(SCHEMA_ENCODING_COLUMN, 3);
    assert_eq!(BASE_RID_COLUMN, 4);
    assert_eq!(METADATA_COLUMNS, 5);
}

#[test]
fn page_kind_maps_to_directory_names() {
    assert_eq!(PageKind::Base.as_str(), "base");
    assert_eq!(PageKind::Tail.as_str(), "tail");
}

#[test]
fn config_defaults() {
    let config = Config::default();
    assert_eq!(config.buffer_pool_frames, 32);
    assert_eq!(config.merge_threshold_pages, 10);
}

#[test]
fn config_builder_overrides() {
    let config = Config::builder()
        .buffer_pool_frames(2)
        .merge_threshold_pages(1)
        .build();
    assert_eq!(config.buffer_pool_frames, 2);
    assert_eq!(config.merge_threshold_pages, 1);
    assert_eq!(config.data_dir, std::path::PathBuf::from("./db_data"));
}

#[test]
fn record_location_serde_round_trip() {
    let loc = RecordLocation {
        range: 3,
        page: 1,
        slot: 511,
    };
    let json = serde_json::to_string(&loc).unwrap();
    let back: RecordLocation = serde_json::from_str(&json).unwrap();
    assert_eq!(loc, back);
}
