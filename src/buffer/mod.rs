pub mod io_buffer_pool;
