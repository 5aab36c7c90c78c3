pub(crate) mod push;
pub(crate) mod response;
