// SQLite schema definitions
// Snowflake ids are stored as signed 64-bit integers.

diesel::table! {
    alerts (message_id) {
        message_id -> BigInt,
        guild_id -> BigInt,
        channel_id -> BigInt,
        created_ts -> BigInt,
        outcome -> Nullable<Text>,
        incomplete -> Bool,
        last_ts -> BigInt,
        creator_id -> Nullable<BigInt>,
        team -> Nullable<Integer>,
    }
}

diesel::table! {
    participants (message_id, user_id) {
        message_id -> BigInt,
        user_id -> BigInt,
        added_by -> Nullable<BigInt>,
        source -> Text,
        ts -> BigInt,
    }
}

diesel::table! {
    counters (guild_id, kind, user_id) {
        guild_id -> BigInt,
        kind -> Text,
        user_id -> BigInt,
        count -> BigInt,
    }
}

diesel::table! {
    board_posts (guild_id, kind) {
        guild_id -> BigInt,
        kind -> Text,
        channel_id -> BigInt,
        message_id -> BigInt,
    }
}

diesel::table! {
    aggregate_seeds (guild_id, scope) {
        guild_id -> BigInt,
        scope -> Text,
        attacks -> BigInt,
        wins -> BigInt,
        losses -> BigInt,
        incomplete -> BigInt,
    }
}

diesel::table! {
    hourly_seeds (guild_id) {
        guild_id -> BigInt,
        morning -> BigInt,
        afternoon -> BigInt,
        evening -> BigInt,
        night -> BigInt,
    }
}

diesel::joinable!(participants -> alerts (message_id));

diesel::allow_tables_to_appear_in_same_query!(
    alerts,
    participants,
    counters,
    board_posts,
    aggregate_seeds,
    hourly_seeds,
);
