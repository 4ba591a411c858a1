pub mod delta_page;
pub mod page_builder;
pub mod page_map;
pub mod record_page;
