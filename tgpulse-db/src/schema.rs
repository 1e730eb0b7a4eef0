pub mod data_schema {
    pub mod data {
        diesel::table! {
            data.channels (id) {
                id -> Uuid,
                tenant -> Text,
                tg_channel_id -> Nullable<Int8>,
                username -> Nullable<Text>,
                title -> Nullable<Text>,
                active -> Bool,
                last_parsed_at -> Nullable<Timestamptz>,
                settings -> Jsonb,
                created_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.user_channel (id) {
                id -> Int8,
                user_id -> Uuid,
                channel_id -> Uuid,
                active -> Bool,
                subscribed_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.posts (id) {
                id -> Uuid,
                tenant -> Text,
                channel_id -> Uuid,
                tg_message_id -> Int8,
                source -> Text,
                posted_at -> Timestamptz,
                content -> Text,
                word_count -> Int4,
                grouped_id -> Nullable<Int8>,
                forward_from_channel_id -> Nullable<Int8>,
                forward_from_message_id -> Nullable<Int8>,
                reply_to_message_id -> Nullable<Int8>,
                author -> Nullable<Text>,
                expires_at -> Timestamptz,
                content_hash -> Text,
                enrichment_status -> Text,
                created_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.media_objects (sha256) {
                sha256 -> Text,
                tenant -> Text,
                mime -> Text,
                size_bytes -> Int8,
                s3_key -> Text,
                first_seen_at -> Timestamptz,
                last_seen_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.post_media_map (id) {
                id -> Int8,
                post_id -> Uuid,
                sha256 -> Text,
                position -> Int4,
            }
        }

        diesel::table! {
            data.media_groups (id) {
                id -> Uuid,
                channel_id -> Uuid,
                grouped_id -> Int8,
                items_count -> Int4,
                post_ids -> Array<Uuid>,
                media_types -> Array<Text>,
                media_sha256s -> Array<Text>,
                created_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.post_enrichment (id) {
                id -> Int8,
                post_id -> Uuid,
                kind -> Text,
                provider -> Text,
                data -> Jsonb,
                created_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.indexing_status (post_id) {
                post_id -> Uuid,
                embedding_status -> Text,
                graph_status -> Text,
                retry_count -> Int4,
                last_error -> Nullable<Text>,
                updated_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.trend_clusters (id) {
                id -> Uuid,
                tenant -> Text,
                label -> Text,
                primary_topic -> Text,
                centroid -> Array<Float8>,
                status -> Text,
                is_generic -> Bool,
                coherence -> Float8,
                parent_id -> Nullable<Uuid>,
                level -> Int4,
                freq_short -> Int8,
                baseline -> Float8,
                source_channels -> Array<Uuid>,
                cooldown_until -> Nullable<Timestamptz>,
                last_activity_at -> Timestamptz,
            }
        }

        diesel::table! {
            data.digest_history (id) {
                id -> Int8,
                tenant -> Text,
                user_id -> Uuid,
                digest_date -> Date,
                status -> Text,
                detail -> Nullable<Text>,
                created_at -> Timestamptz,
                sent_at -> Nullable<Timestamptz>,
            }
        }

        diesel::joinable!(posts -> channels (channel_id));
        diesel::joinable!(user_channel -> channels (channel_id));
        diesel::joinable!(post_media_map -> posts (post_id));
        diesel::joinable!(post_enrichment -> posts (post_id));
        diesel::joinable!(indexing_status -> posts (post_id));

        diesel::allow_tables_to_appear_in_same_query!(
            channels,
            user_channel,
            posts,
            media_objects,
            post_media_map,
            media_groups,
            post_enrichment,
            indexing_status,
            trend_clusters,
            digest_history,
        );
    }
}

pub mod info_schema {
    pub mod info {
        diesel::table! {
            info.outbox_events (id) {
                id -> Int8,
                event_type -> Text,
                aggregate_id -> Text,
                content_hash -> Text,
                payload -> Jsonb,
                created_at -> Timestamptz,
                processed_at -> Nullable<Timestamptz>,
                retries -> Int4,
                last_error -> Nullable<Text>,
            }
        }

        diesel::table! {
            info.processed_events (idempotency_key) {
                idempotency_key -> Text,
                stage -> Text,
                processed_at -> Timestamptz,
            }
        }

        diesel::table! {
            info.storage_usage (id) {
                id -> Int8,
                tenant -> Text,
                content_type -> Text,
                bytes -> Int8,
                objects -> Int8,
                last_updated -> Timestamptz,
            }
        }
    }
}
