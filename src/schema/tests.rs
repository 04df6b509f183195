use super::*;

fn two_col_schema() -> Schema {
    Schema::new(
        1,
        vec![
            ColumnDef {
                id: 0,
                ty: ColType::Timestamp,
            },
            ColumnDef {
                id: 1,
                ty: ColType::Double,
            },
        ],
    )
    .unwrap()
}

#[test]
fn first_column_must_be_timestamp() {
    let err = Schema::new(
        1,
        vec![ColumnDef {
            id: 0,
            ty: ColType::Int,
        }],
    )
    .unwrap_err();
    assert!(matches!(err, SchemaError::Invalid(_)));
}

#[test]
fn column_ids_must_increase() {
    let err = Schema::new(
        1,
        vec![
            ColumnDef {
                id: 0,
                ty: ColType::Timestamp,
            },
            ColumnDef {
                id: 0,
                ty: ColType::Int,
            },
        ],
    )
    .unwrap_err();
    assert!(matches!(err, SchemaError::Invalid(_)));
}

#[test]
fn row_round_trip() {
    let schema = two_col_schema();
    assert_eq!(schema.row_len(), ROW_HEADER_SIZE + 8);

    let row = schema.build_row(42_000, &7.5f64.to_le_bytes()).unwrap();
    assert_eq!(row.len(), schema.row_len());
    assert_eq!(row_len_of(&row), Some(schema.row_len()));
    assert_eq!(row_ts(&row), 42_000);
    schema.check_row(&row).unwrap();
}

#[test]
fn wrong_payload_size_is_rejected() {
    let schema = two_col_schema();
    let err = schema.build_row(1, &[0u8; 4]).unwrap_err();
    assert!(matches!(err, SchemaError::RowMismatch { .. }));
}

#[test]
fn schema_encoding_round_trip() {
    let schema = Schema::new(
        3,
        vec![
            ColumnDef {
                id: 0,
                ty: ColType::Timestamp,
            },
            ColumnDef {
                id: 1,
                ty: ColType::Int,
            },
            ColumnDef {
                id: 5,
                ty: ColType::Double,
            },
        ],
    )
    .unwrap();

    let bytes = crate::encoding::encode_to_vec(&schema).unwrap();
    let (decoded, consumed) = crate::encoding::decode_from_slice::<Schema>(&bytes).unwrap();
    assert_eq!(decoded, schema);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn column_batch_splits_and_reassembles() {
    let schema = Schema::new(
        1,
        vec![
            ColumnDef {
                id: 0,
                ty: ColType::Timestamp,
            },
            ColumnDef {
                id: 1,
                ty: ColType::Int,
            },
            ColumnDef {
                id: 2,
                ty: ColType::Double,
            },
        ],
    )
    .unwrap();

    let mut batch = ColumnBatch::new(&schema);
    for i in 0..5i64 {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(i as i32 * 10).to_le_bytes());
        payload.extend_from_slice(&(i as f64 / 2.0).to_le_bytes());
        let row = schema.build_row(i * 1000, &payload).unwrap();
        batch.push_row(&schema, &row).unwrap();
    }

    assert_eq!(batch.num_rows(), 5);
    assert_eq!(batch.num_cols(), 3);
    assert_eq!(batch.col_bytes(0).len(), 5 * 8);
    assert_eq!(batch.col_bytes(1).len(), 5 * 4);
    assert_eq!(batch.col_bytes(2).len(), 5 * 8);

    for i in 0..5i64 {
        assert_eq!(batch.ts_at(i as usize), i * 1000);
        let row = batch.row_at(&schema, i as usize);
        schema.check_row(&row).unwrap();
        assert_eq!(row_ts(&row), i * 1000);
    }
}

#[test]
fn load_col_validates_length() {
    let schema = two_col_schema();
    let mut batch = ColumnBatch::new(&schema);

    batch.load_col(0, &[0u8; 16], 2).unwrap();
    assert_eq!(batch.num_rows(), 2);

    let err = batch.load_col(1, &[0u8; 7], 2).unwrap_err();
    assert!(matches!(err, SchemaError::RowMismatch { .. }));
}
