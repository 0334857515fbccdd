//! Wire constants for the binary key/value protocol.

/// Magic byte for a client request.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Magic byte for a server response.
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Magic byte for a request with flexible framing extras.
pub const MAGIC_ALT_REQUEST: u8 = 0x08;
/// Magic byte for a response with flexible framing extras.
pub const MAGIC_ALT_RESPONSE: u8 = 0x18;

/// Size of the fixed header on the wire.
pub const HEADER_SIZE: usize = 24;

/// Raw-bytes datatype.
pub const DATATYPE_RAW: u8 = 0x00;
/// JSON datatype bit.
pub const DATATYPE_JSON: u8 = 0x01;

// Opcodes.

/// Fetch a document.
pub const OP_GET: u8 = 0x00;
/// Unconditional store.
pub const OP_SET: u8 = 0x01;
/// Store only if absent.
pub const OP_ADD: u8 = 0x02;
/// Store only if present.
pub const OP_REPLACE: u8 = 0x03;
/// Remove a document.
pub const OP_DELETE: u8 = 0x04;
/// Increment a counter document.
pub const OP_INCREMENT: u8 = 0x05;
/// Decrement a counter document.
pub const OP_DECREMENT: u8 = 0x06;
/// No-op; used as a liveness canary.
pub const OP_NOOP: u8 = 0x0a;
/// Append raw bytes to a document.
pub const OP_APPEND: u8 = 0x0e;
/// Prepend raw bytes to a document.
pub const OP_PREPEND: u8 = 0x0f;
/// Feature negotiation handshake.
pub const OP_HELLO: u8 = 0x1f;
/// Update a document's expiry without touching its value.
pub const OP_TOUCH: u8 = 0x1c;
/// Fetch a document and update its expiry.
pub const OP_GET_AND_TOUCH: u8 = 0x1d;
/// List the SASL mechanisms the server accepts.
pub const OP_SASL_LIST_MECHANISMS: u8 = 0x20;
/// Start a SASL conversation.
pub const OP_SASL_AUTH: u8 = 0x21;
/// Continue a SASL conversation.
pub const OP_SASL_STEP: u8 = 0x22;
/// Bind this connection to one bucket's namespace.
pub const OP_SELECT_BUCKET: u8 = 0x89;
/// Observe replication/persistence state of a key.
pub const OP_OBSERVE: u8 = 0x92;
/// Fetch a document and lock it against writes.
pub const OP_GET_AND_LOCK: u8 = 0x94;
/// Release a lock taken by GetAndLock.
pub const OP_UNLOCK: u8 = 0x95;
/// Request the current cluster configuration.
pub const OP_GET_CLUSTER_CONFIG: u8 = 0xb5;
/// Fetch the collections manifest for the selected bucket.
pub const OP_GET_COLLECTIONS_MANIFEST: u8 = 0xba;
/// Resolve a scope.collection name to its numeric id.
pub const OP_GET_CID: u8 = 0xbb;
/// Multi-path sub-document lookup.
pub const OP_SUBDOC_MULTI_LOOKUP: u8 = 0xd0;
/// Multi-path sub-document mutation.
pub const OP_SUBDOC_MULTI_MUTATION: u8 = 0xd1;
/// Fetch the server's error map.
pub const OP_GET_ERROR_MAP: u8 = 0xfe;

// Per-path sub-document opcodes carried inside multi-path bodies.

/// Read the value at a path.
pub const SUBDOC_GET: u8 = 0xc5;
/// Test whether a path exists.
pub const SUBDOC_EXISTS: u8 = 0xc6;
/// Insert a dictionary entry; fail if the path exists.
pub const SUBDOC_DICT_ADD: u8 = 0xc7;
/// Insert or replace a dictionary entry.
pub const SUBDOC_DICT_UPSERT: u8 = 0xc8;
/// Remove the value at a path.
pub const SUBDOC_DELETE: u8 = 0xc9;
/// Replace the value at a path; fail if absent.
pub const SUBDOC_REPLACE: u8 = 0xca;
/// Append to an array.
pub const SUBDOC_ARRAY_PUSH_LAST: u8 = 0xcb;
/// Prepend to an array.
pub const SUBDOC_ARRAY_PUSH_FIRST: u8 = 0xcc;
/// Insert into an array at an index path.
pub const SUBDOC_ARRAY_INSERT: u8 = 0xcd;
/// Append to an array only if the value is not already present.
pub const SUBDOC_ARRAY_ADD_UNIQUE: u8 = 0xce;
/// Atomic add on a numeric path.
pub const SUBDOC_COUNTER: u8 = 0xcf;
/// Count the members at a path.
pub const SUBDOC_GET_COUNT: u8 = 0xd2;

/// Path flag: create intermediate path components.
pub const SUBDOC_FLAG_CREATE_PATH: u8 = 0x01;
/// Path flag: the path addresses an extended attribute.
pub const SUBDOC_FLAG_XATTR: u8 = 0x04;
/// Path flag: expand server-side macros in the payload.
pub const SUBDOC_FLAG_EXPAND_MACROS: u8 = 0x10;

// HELLO feature codes.

/// Datatype field is honored.
pub const FEATURE_DATATYPE: u16 = 0x01;
/// TCP_NODELAY requested.
pub const FEATURE_TCP_NODELAY: u16 = 0x03;
/// Mutation responses carry a mutation sequence number.
pub const FEATURE_MUTATION_SEQNO: u16 = 0x04;
/// Sub-document extended attributes.
pub const FEATURE_XATTR: u16 = 0x06;
/// Extended error codes (enables the error map).
pub const FEATURE_XERROR: u16 = 0x07;
/// SELECT_BUCKET is available.
pub const FEATURE_SELECT_BUCKET: u16 = 0x08;
/// Server-measured operation durations in responses.
pub const FEATURE_SERVER_DURATION: u16 = 0x0f;
/// Flexible framing extras on requests.
pub const FEATURE_ALT_REQUEST: u16 = 0x10;
/// Durable writes (sync-replication).
pub const FEATURE_SYNC_REPLICATION: u16 = 0x11;
/// Collection-aware operations.
pub const FEATURE_COLLECTIONS: u16 = 0x12;

/// Flexible framing extra id carrying a durability requirement.
pub const FRAME_EXTRA_DURABILITY: u8 = 0x01;

// Status words.

/// Operation succeeded.
pub const STATUS_SUCCESS: u16 = 0x0000;
/// The key does not exist.
pub const STATUS_KEY_NOT_FOUND: u16 = 0x0001;
/// The key exists (or a CAS precondition failed).
pub const STATUS_KEY_EXISTS: u16 = 0x0002;
/// The value exceeds the server's size limit.
pub const STATUS_VALUE_TOO_LARGE: u16 = 0x0003;
/// The request was malformed or its arguments invalid.
pub const STATUS_INVALID_ARGUMENTS: u16 = 0x0004;
/// The item was not stored (append/prepend on a missing key).
pub const STATUS_NOT_STORED: u16 = 0x0005;
/// Increment/decrement on a non-numeric value.
pub const STATUS_DELTA_BADVAL: u16 = 0x0006;
/// The vBucket is not owned by this node.
pub const STATUS_NOT_MY_VBUCKET: u16 = 0x0007;
/// No bucket is selected on this connection.
pub const STATUS_NO_BUCKET: u16 = 0x0008;
/// The document is locked.
pub const STATUS_LOCKED: u16 = 0x0009;
/// Authentication material has gone stale; re-authenticate.
pub const STATUS_AUTH_STALE: u16 = 0x001f;
/// Authentication failed.
pub const STATUS_AUTH_ERROR: u16 = 0x0020;
/// Authentication requires a further SASL step.
pub const STATUS_AUTH_CONTINUE: u16 = 0x0021;
/// A numeric argument was outside the accepted range.
pub const STATUS_ERANGE: u16 = 0x0022;
/// Access denied for the authenticated user.
pub const STATUS_EACCESS: u16 = 0x0024;
/// The node is still warming up.
pub const STATUS_NOT_INITIALIZED: u16 = 0x0025;
/// The opcode is unknown to the server.
pub const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;
/// The server is out of memory.
pub const STATUS_OUT_OF_MEMORY: u16 = 0x0082;
/// The operation is not supported.
pub const STATUS_NOT_SUPPORTED: u16 = 0x0083;
/// Internal server error.
pub const STATUS_INTERNAL_ERROR: u16 = 0x0084;
/// The server is too busy.
pub const STATUS_BUSY: u16 = 0x0085;
/// Temporary failure; retry later.
pub const STATUS_TEMPORARY_FAILURE: u16 = 0x0086;
/// The collection id is unknown (outdated manifest).
pub const STATUS_UNKNOWN_COLLECTION: u16 = 0x0088;
/// The requested durability level is invalid.
pub const STATUS_DURABILITY_INVALID_LEVEL: u16 = 0x00a0;
/// The requested durability level cannot currently be met.
pub const STATUS_DURABILITY_IMPOSSIBLE: u16 = 0x00a1;
/// A durable write on this key is already in progress.
pub const STATUS_SYNC_WRITE_IN_PROGRESS: u16 = 0x00a2;
/// A durable write completed with an ambiguous outcome.
pub const STATUS_SYNC_WRITE_AMBIGUOUS: u16 = 0x00a3;
/// Sub-document: the path was not found.
pub const STATUS_SUBDOC_PATH_NOT_FOUND: u16 = 0x00c0;
/// Sub-document: path type conflicts with the document.
pub const STATUS_SUBDOC_PATH_MISMATCH: u16 = 0x00c1;
/// Sub-document: the path syntax is invalid.
pub const STATUS_SUBDOC_PATH_INVALID: u16 = 0x00c2;
/// Sub-document: the path is too long or too deep.
pub const STATUS_SUBDOC_PATH_TOO_BIG: u16 = 0x00c3;
/// Sub-document: the document is too deep to parse.
pub const STATUS_SUBDOC_DOC_TOO_DEEP: u16 = 0x00c4;
/// Sub-document: the value cannot be inserted at the path.
pub const STATUS_SUBDOC_CANNOT_INSERT: u16 = 0x00c5;
/// Sub-document: the document is not JSON.
pub const STATUS_SUBDOC_DOC_NOT_JSON: u16 = 0x00c6;
/// Sub-document: the numeric value is out of range.
pub const STATUS_SUBDOC_NUM_RANGE: u16 = 0x00c7;
/// Sub-document: the counter delta is out of range.
pub const STATUS_SUBDOC_DELTA_RANGE: u16 = 0x00c8;
/// Sub-document: the path already exists.
pub const STATUS_SUBDOC_PATH_EXISTS: u16 = 0x00c9;
/// Sub-document: the resulting value would be too deep.
pub const STATUS_SUBDOC_VALUE_TOO_DEEP: u16 = 0x00ca;
/// Sub-document: invalid combination of specs.
pub const STATUS_SUBDOC_INVALID_COMBO: u16 = 0x00cb;
/// Sub-document: one or more paths in a multi-path op failed.
pub const STATUS_SUBDOC_MULTI_PATH_FAILURE: u16 = 0x00cc;
