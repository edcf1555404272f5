mod archive_manager;
