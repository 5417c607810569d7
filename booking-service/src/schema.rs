diesel::table! {
    bookings (id) {
        id -> Uuid,
        event_id -> Uuid,
        user_id -> Uuid,
        ticket_type_id -> Nullable<Uuid>,
        reservation_token -> Nullable<Uuid>,
        promo_code -> Nullable<Varchar>,
        quantity -> Int4,
        unit_price -> Numeric,
        discount_amount -> Numeric,
        total_amount -> Numeric,
        state -> Varchar,
        failure_reason -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    events (id) {
        id -> Uuid,
        title -> Varchar,
        starts_at -> Timestamptz,
        is_free -> Bool,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    payments (id) {
        id -> Uuid,
        booking_id -> Uuid,
        phone_number -> Varchar,
        provider_reference -> Nullable<Varchar>,
        status -> Varchar,
        amount -> Numeric,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    promo_codes (code) {
        code -> Varchar,
        event_id -> Nullable<Uuid>,
        discount_type -> Varchar,
        discount_value -> Numeric,
        max_uses -> Nullable<Int4>,
        max_uses_per_user -> Int4,
        current_uses -> Int4,
        valid_from -> Timestamptz,
        valid_until -> Timestamptz,
        is_active -> Bool,
    }
}

diesel::table! {
    promo_redemptions (id) {
        id -> Uuid,
        code -> Varchar,
        user_id -> Uuid,
        booking_id -> Uuid,
        redeemed_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (token) {
        token -> Uuid,
        ticket_type_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_types (id) {
        id -> Uuid,
        event_id -> Uuid,
        name -> Varchar,
        capacity_total -> Nullable<Int4>,
        capacity_reserved -> Int4,
        capacity_confirmed -> Int4,
        unit_price -> Numeric,
        is_active -> Bool,
    }
}

diesel::joinable!(bookings -> events (event_id));
diesel::joinable!(payments -> bookings (booking_id));
diesel::joinable!(promo_redemptions -> bookings (booking_id));
diesel::joinable!(reservations -> ticket_types (ticket_type_id));
diesel::joinable!(ticket_types -> events (event_id));

diesel::allow_tables_to_appear_in_same_query!(
    bookings,
    events,
    outbox_events,
    payments,
    promo_codes,
    promo_redemptions,
    reservations,
    ticket_types,
);
