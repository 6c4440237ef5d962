pub mod aac;
