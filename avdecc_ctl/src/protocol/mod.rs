pub mod aem;
