// Wire codec for the PostgreSQL v3 frontend/backend protocol: frame
// reading/writing, typed client messages, and server response builders.

// Declare submodules
pub mod codec;
pub mod frontend;
pub mod protocol;

// Re-export public items
pub use codec::{
    parse_params, parse_startup, read_bootstrap_message, read_message, read_message_data,
    read_message_header, write_all, write_all_flush, BytesMutReader,
};
pub use frontend::{Bind, BootstrapMessage, FrontendMessage, Parse};
pub use protocol::{
    auth_ok, backend_key_data, bind_complete, cleartext_password_challenge, close_complete,
    command_complete, copy_in_response, data_row, empty_query_response, error_response, no_data,
    notice_response, parameter_description, parameter_status, parse_complete, portal_suspended,
    ready_for_query, row_description, FieldDescription, TransactionStatus,
};

// Constants
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

// Tests
#[cfg(test)]
mod tests;
