pub mod mark_bitmap;
