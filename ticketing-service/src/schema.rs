diesel::table! {
    events (id) {
        id -> Uuid,
        name -> Varchar,
        published -> Bool,
        sale_starts_at -> Nullable<Timestamptz>,
        sale_ends_at -> Nullable<Timestamptz>,
        checked_in_count -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_templates (id) {
        id -> Uuid,
        event_id -> Uuid,
        name -> Varchar,
        price -> Numeric,
        currency -> Varchar,
        total_quantity -> Int4,
        reserved -> Int4,
        sold -> Int4,
        max_per_order -> Nullable<Int4>,
    }
}

diesel::table! {
    buyers (id) {
        id -> Uuid,
        email -> Varchar,
        name -> Varchar,
        phone -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        event_id -> Uuid,
        buyer_id -> Uuid,
        status -> Varchar,
        total -> Numeric,
        currency -> Varchar,
        access_token -> Varchar,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
        paid_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (order_id, template_id) {
        order_id -> Uuid,
        template_id -> Uuid,
        quantity -> Int4,
        unit_price -> Numeric,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        template_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    payments (id) {
        id -> Uuid,
        order_id -> Uuid,
        gateway -> Varchar,
        external_id -> Nullable<Varchar>,
        attempt -> Int4,
        idempotency_key -> Varchar,
        status -> Varchar,
        amount -> Numeric,
        currency -> Varchar,
        raw_payload -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    rp_profiles (id) {
        id -> Uuid,
        event_id -> Uuid,
        code -> Varchar,
        display_name -> Varchar,
        active -> Bool,
        expires_at -> Nullable<Timestamptz>,
        max_tickets -> Nullable<Int4>,
        tickets_generated -> Int4,
        tickets_used -> Int4,
    }
}

diesel::table! {
    guest_types (id) {
        id -> Uuid,
        event_id -> Uuid,
        name -> Varchar,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        event_id -> Uuid,
        order_id -> Nullable<Uuid>,
        rp_profile_id -> Nullable<Uuid>,
        template_id -> Nullable<Uuid>,
        guest_type_id -> Nullable<Uuid>,
        unit_index -> Int4,
        qr_code -> Varchar,
        status -> Varchar,
        holder_name -> Nullable<Varchar>,
        nickname -> Nullable<Varchar>,
        created_at -> Timestamptz,
        used_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    webhook_logs (id) {
        id -> Uuid,
        gateway -> Varchar,
        external_event_id -> Nullable<Varchar>,
        event_type -> Nullable<Varchar>,
        verified -> Bool,
        order_id -> Nullable<Uuid>,
        outcome -> Nullable<Varchar>,
        payload -> Jsonb,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
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

diesel::joinable!(ticket_templates -> events (event_id));
diesel::joinable!(orders -> events (event_id));
diesel::joinable!(orders -> buyers (buyer_id));
diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(payments -> orders (order_id));
diesel::joinable!(rp_profiles -> events (event_id));
diesel::joinable!(guest_types -> events (event_id));

diesel::allow_tables_to_appear_in_same_query!(
    events,
    ticket_templates,
    buyers,
    orders,
    order_items,
    reservations,
    payments,
    rp_profiles,
    guest_types,
    tickets,
    webhook_logs,
    outbox_events,
);
