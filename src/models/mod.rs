pub mod ps_head;
pub mod rfcn;
