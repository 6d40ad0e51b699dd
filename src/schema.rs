diesel::table! {
    microphone_profiles (slug) {
        slug -> Text,
        name -> Text,
        description -> Nullable<Text>,
        match_pattern -> Nullable<Text>,  // case-insensitive substring of the device model
        config -> Text,                   // JSON object
        is_system -> Bool,
    }
}

diesel::table! {
    devices (name) {
        name -> Text,
        serial_number -> Text,
        model -> Text,
        status -> Text,             // online | offline
        enrollment_status -> Text,  // pending | enrolled | rejected
        last_seen -> Nullable<Timestamp>,
        enabled -> Bool,
        profile_slug -> Nullable<Text>,
        config -> Text,             // JSON object
    }
}

diesel::table! {
    storage_remotes (slug) {
        slug -> Text,
        #[sql_name = "type"]
        remote_type -> Text,        // s3 | webdav | sftp ...
        name -> Text,
        config -> Text,             // JSON object, credentials encrypted by the caller
        is_active -> Bool,
        target_path -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    recordings (id) {
        id -> BigInt,
        time -> Timestamp,
        sensor_id -> Text,          // FK to devices.name
        file_raw -> Text,
        file_processed -> Text,
        duration -> Double,
        sample_rate -> Integer,
        filesize_raw -> BigInt,
        filesize_processed -> BigInt,
        uploaded -> Bool,
        uploaded_at -> Nullable<Timestamp>,
        local_deleted -> Bool,
        analysis_state -> Text,     // JSON: worker -> AnalysisEntry
        upload_info -> Text,        // JSON: remote slug -> RemoteUploadSummary
        version -> Integer,
    }
}

diesel::table! {
    uploads (id) {
        id -> BigInt,
        recording_id -> BigInt,
        remote_slug -> Text,
        attempt_at -> Timestamp,
        filename -> Text,
        size -> BigInt,
        success -> Bool,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    detections (time, id) {
        time -> Timestamp,
        id -> BigInt,
        end_time -> Timestamp,
        recording_id -> BigInt,
        worker -> Text,
        confidence -> Double,
        label -> Text,
        common_name -> Nullable<Text>,
        details -> Text,            // JSON object
    }
}

diesel::table! {
    taxonomy (worker, label) {
        worker -> Text,
        label -> Text,
        scientific_name -> Text,
        common_names -> Text,       // JSON: locale -> text
        description -> Text,        // JSON: locale -> text
        image_path -> Nullable<Text>,
        image_source -> Nullable<Text>,
        conservation_status -> Nullable<Text>,
    }
}

diesel::table! {
    weather (time, source) {
        time -> Timestamp,
        source -> Text,
        station_code -> Nullable<Text>,
        temp_c -> Nullable<Double>,
        humidity -> Nullable<Double>,
        pressure_hpa -> Nullable<Double>,
        wind_speed_kmh -> Nullable<Double>,
        wind_gusts_kmh -> Nullable<Double>,
        precipitation_mm -> Nullable<Double>,
        cloud_cover -> Nullable<Integer>,
        uv_index -> Nullable<Double>,
        sunshine_duration -> Nullable<Double>,
        weather_code -> Nullable<Integer>,
        is_forecast -> Bool,
        extra -> Text,              // JSON object
    }
}

diesel::table! {
    system_config (key) {
        key -> Text,
        value -> Text,              // any JSON document
    }
}

diesel::joinable!(devices -> microphone_profiles (profile_slug));
diesel::joinable!(recordings -> devices (sensor_id));
diesel::joinable!(uploads -> recordings (recording_id));
diesel::joinable!(uploads -> storage_remotes (remote_slug));
diesel::joinable!(detections -> recordings (recording_id));

diesel::allow_tables_to_appear_in_same_query!(
    microphone_profiles,
    devices,
    storage_remotes,
    recordings,
    uploads,
    detections,
    taxonomy,
    weather,
    system_config,
);
