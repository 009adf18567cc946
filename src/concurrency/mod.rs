pub mod thread_resource_mgr;
