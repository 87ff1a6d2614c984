pub mod hit_source;
pub mod map_info;
pub mod sam;
pub mod temp_record;
pub mod threads;
