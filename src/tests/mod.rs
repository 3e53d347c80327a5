mod pack;
mod vpk;
