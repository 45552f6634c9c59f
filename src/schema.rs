// Mirrors migrations/2025-06-01-000000_create_rollup_rules/up.sql.
//
// Measurement and rollup tables are created at runtime with names taken from
// payloads and rules, so they have no static declaration here; see `db::query`.

diesel::table! {
    rollup_rules (rank) {
        rank -> BigInt,
        src_table -> Text,
        src_delete -> Text,
        dst_table -> Text,
        aggr1 -> Text,
        aggr2 -> Text,
        aggr3 -> Text,
        aggr4 -> Text,
        period -> BigInt,
        retention -> BigInt,
    }
}
